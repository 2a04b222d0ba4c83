//! OpenAI-compatible translation core for the Grok upstream API.
//!
//! The upstream speaks newline-delimited JSON with its own
//! conversation/session lifecycle; clients speak OpenAI chat completions.
//! This crate owns the translation between them: the streaming NDJSON→SSE
//! transformer and its non-streaming collector, the tool-usage card parser,
//! the conversation record store, the gRPC-Web codec used for account
//! bootstrap, and the rate-limit response normaliser. HTTP routing,
//! authentication and byte serving live in the embedding application.

use std::time::Duration;

use serde::Serialize;

pub mod account;
pub mod assets;
pub mod config;
pub mod database;
pub mod error;
pub mod format;
pub mod frame;
pub mod grpc_web;
pub mod history;
pub mod rate_limit;
mod response;
pub mod sessions;
mod streaming;
pub mod tool_cards;

pub use config::{RelayConfig, StreamSettings};
pub use error::Error;
pub use response::collect_response;
pub use streaming::{stream_ndjson_to_channel, SseReceiver, SseSender, StreamContext};

/// Upstream identity of the conversation a stream is attached to. Both
/// fields start empty and only ever move forward: a later frame wins only
/// when it carries a non-empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationMeta {
    pub grok_conversation_id: String,
    pub last_response_id: String,
}

impl ConversationMeta {
    /// Fold in identifiers from one frame. Returns true when either field
    /// changed.
    pub(crate) fn absorb(
        &mut self,
        conversation_id: Option<&str>,
        response_id: Option<&str>,
    ) -> bool {
        let mut changed = false;

        if let Some(id) = conversation_id.filter(|id| !id.is_empty()) {
            if self.grok_conversation_id != id {
                self.grok_conversation_id = id.to_string();
                changed = true;
            }
        }

        if let Some(id) = response_id.filter(|id| !id.is_empty()) {
            if self.last_response_id != id {
                self.last_response_id = id.to_string();
                changed = true;
            }
        }

        changed
    }
}

/// How a stream ended, reported once through [StreamHooks::on_finish].
#[derive(Debug, Clone, Serialize)]
pub struct StreamFinishResult {
    /// 200 for a clean finish, 500 when the upstream reported an error or
    /// processing failed.
    pub status: u16,
    /// Wall-clock duration of the stream.
    #[serde(serialize_with = "serialize_duration_seconds", rename = "duration_seconds")]
    pub duration: Duration,
    pub meta: ConversationMeta,
}

fn serialize_duration_seconds<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Collaborator callbacks for a single stream. `on_meta` fires each time the
/// conversation identity advances; `on_finish` fires exactly once at
/// termination. Callbacks are awaited in-line and must not re-enter the
/// stream.
#[async_trait::async_trait]
pub trait StreamHooks: Send {
    async fn on_meta(&mut self, _meta: &ConversationMeta) {}
    async fn on_finish(&mut self, _result: &StreamFinishResult) {}
}

/// Hooks that do nothing; for callers that only need the SSE output.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait::async_trait]
impl StreamHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_updates_are_monotonic() {
        let mut meta = ConversationMeta::default();
        assert!(meta.absorb(Some("c1"), None));
        assert!(meta.absorb(None, Some("r1")));

        // Empty values never clobber.
        assert!(!meta.absorb(Some(""), None));
        assert_eq!(meta.grok_conversation_id, "c1");

        // Same values are not a change.
        assert!(!meta.absorb(Some("c1"), Some("r1")));

        // Later non-empty values win.
        assert!(meta.absorb(None, Some("r2")));
        assert_eq!(meta.last_response_id, "r2");
    }

    #[test]
    fn finish_result_serialises_duration_as_seconds() {
        let result = StreamFinishResult {
            status: 200,
            duration: Duration::from_millis(1500),
            meta: ConversationMeta::default(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_seconds"], serde_json::json!(1.5));
        assert_eq!(value["status"], serde_json::json!(200));
    }
}
