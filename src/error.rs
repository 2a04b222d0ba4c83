#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to read configuration file")]
    ReadingConfig,
    #[error("Upstream session endpoint rejected the request")]
    SessionRequest,
    #[error("Failed to parse upstream session response")]
    SessionResponse,
    #[error("grpc-web compressed frame is not supported")]
    GrpcCompressedFrame,
    #[error("Upstream returned an error: {0}")]
    Upstream(String),
    #[error("Failed to load from the database")]
    LoadingDatabase,
    #[error("Failed to write to the database")]
    WritingDatabase,
}
