//! Deterministic identity for "the same conversation so far": a SHA-256 over
//! the ordered non-assistant history, plus the tenant scope string used to
//! isolate conversation records.

use sha2::{Digest, Sha256};

use crate::format::ChatMessage;

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hash the non-assistant history of a message list.
///
/// Parts are `system:<text>` for every system message with non-empty text,
/// followed by `user:<text>` for every user message with non-empty text. When
/// `exclude_last_user` is set and the list contains an assistant message, the
/// final user part is dropped, so a request that appends one new user turn
/// hashes to the identity of the stored conversation it continues.
///
/// Returns the empty string when no parts remain.
pub fn history_hash(messages: &[ChatMessage], exclude_last_user: bool) -> String {
    let mut system_parts = Vec::new();
    let mut user_parts = Vec::new();
    let mut has_assistant = false;

    for message in messages {
        match message.role.as_str() {
            "system" => {
                let text = message.content.extract_text();
                if !text.is_empty() {
                    system_parts.push(format!("system:{text}"));
                }
            }
            "user" => {
                let text = message.content.extract_text();
                if !text.is_empty() {
                    user_parts.push(format!("user:{text}"));
                }
            }
            "assistant" => has_assistant = true,
            _ => {}
        }
    }

    if exclude_last_user && has_assistant && !user_parts.is_empty() {
        user_parts.pop();
    }

    let mut parts = system_parts;
    parts.append(&mut user_parts);
    if parts.is_empty() {
        return String::new();
    }

    sha256_hex(&parts.join("\n"))
}

/// Build the tenant scope for a request: the API key when present, the client
/// IP otherwise. Both are fingerprinted so raw credentials never reach the
/// store.
pub fn scope_for(api_key: Option<&str>, client_ip: Option<&str>) -> String {
    let key = api_key.map(str::trim).unwrap_or("");
    if !key.is_empty() {
        return format!("k:{}", sha256_hex(key));
    }

    let ip = client_ip.filter(|ip| !ip.is_empty()).unwrap_or("0.0.0.0");
    format!("ip:{}", sha256_hex(ip))
}
