//! gRPC-Web framing. The account-bootstrap flow speaks
//! `application/grpc-web+proto` over plain HTTP; this module owns the byte
//! layer: frame encoding, frame/trailer decoding, and the base64-text
//! heuristic for `grpc-web-text` bodies.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use error_stack::{Report, ResultExt};
use percent_encoding::percent_decode_str;

use crate::Error;

/// How many leading bytes the base64-text sniffer inspects.
const BASE64_SNIFF_LIMIT: usize = 1024;

/// Parsed gRPC-Web response: data frames plus trailer metadata.
#[derive(Debug, Clone, Default)]
pub struct GrpcWebResponse {
    pub messages: Vec<Bytes>,
    pub trailers: BTreeMap<String, String>,
    pub grpc_status: Option<i64>,
    pub grpc_message: String,
}

/// Encode a payload as a single uncompressed gRPC-Web data frame:
/// `0x00 || uint32be(len) || payload`.
pub fn encode_grpc_web_frame(payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Bytes::from(frame)
}

/// Parse a gRPC-Web response body.
///
/// Bodies hinted (or sniffed) as `grpc-web-text` are base64-decoded first.
/// Trailer frames (high flag bit) merge into the trailer map; when the body
/// carries no `grpc-status`, the HTTP response headers are consulted instead.
/// Compressed data frames are a hard failure.
pub fn parse_grpc_web_response(
    body: &[u8],
    headers: Option<&http::HeaderMap>,
    content_type: Option<&str>,
) -> Result<GrpcWebResponse, Report<Error>> {
    let decoded;
    let mut bytes = body;
    if looks_like_base64_text(body, content_type) {
        let compact: Vec<u8> = body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        match STANDARD.decode(&compact) {
            Ok(plain) => {
                decoded = plain;
                bytes = &decoded;
            }
            Err(err) => {
                tracing::debug!(?err, "body sniffed as grpc-web-text but failed to decode");
            }
        }
    }

    let mut result = GrpcWebResponse::default();

    let mut offset = 0;
    while bytes.len() - offset >= 5 {
        let flag = bytes[offset];
        let length = u32::from_be_bytes([
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
            bytes[offset + 4],
        ]) as usize;

        let Some(end) = offset.checked_add(5 + length).filter(|end| *end <= bytes.len()) else {
            break;
        };
        let payload = &bytes[offset + 5..end];

        if flag & 0x80 != 0 {
            merge_trailer_block(payload, &mut result.trailers);
        } else if flag & 0x01 != 0 {
            return Err(Report::new(Error::GrpcCompressedFrame))
                .attach_printable_lazy(|| format!("frame flag {flag:#04x}"));
        } else {
            result.messages.push(Bytes::copy_from_slice(payload));
        }

        offset = end;
    }

    if !result.trailers.contains_key("grpc-status") {
        if let Some(headers) = headers {
            for key in ["grpc-status", "grpc-message"] {
                if let Some(value) = headers.get(key).and_then(|v| v.to_str().ok()) {
                    let value = if key == "grpc-message" {
                        decode_grpc_message(value)
                    } else {
                        value.to_string()
                    };
                    result.trailers.entry(key.to_string()).or_insert(value);
                }
            }
        }
    }

    result.grpc_status = result
        .trailers
        .get("grpc-status")
        .and_then(|s| s.trim().parse::<i64>().ok());
    result.grpc_message = result
        .trailers
        .get("grpc-message")
        .cloned()
        .unwrap_or_default();

    Ok(result)
}

/// True when the content type names `grpc-web-text` or the body's leading
/// bytes look like base64.
fn looks_like_base64_text(body: &[u8], content_type: Option<&str>) -> bool {
    if content_type
        .map(|ct| ct.contains("grpc-web-text"))
        .unwrap_or(false)
    {
        return true;
    }

    if body.is_empty() {
        return false;
    }

    body.iter()
        .take(BASE64_SNIFF_LIMIT)
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'\r' | b'\n'))
}

fn merge_trailer_block(payload: &[u8], trailers: &mut BTreeMap<String, String>) {
    let text = String::from_utf8_lossy(payload);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        let key = key.trim().to_ascii_lowercase();
        let mut value = value.trim().to_string();
        if key == "grpc-message" {
            value = decode_grpc_message(&value);
        }
        trailers.insert(key, value);
    }
}

fn decode_grpc_message(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
