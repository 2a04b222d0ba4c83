//! Client-facing request and response shapes. These hew to the OpenAI chat
//! completion format; only the fields this crate produces or inspects are
//! modeled.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message in an incoming chat request. Content may be a plain string or an
/// array of typed parts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessageContent {
    /// Extract the text of the message: string content as-is, array content
    /// as the concatenation of its `text` items.
    pub fn extract_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect(),
        }
    }
}

/// One streaming chunk in OpenAI chat-completion shape.
#[derive(Serialize, Debug, Clone)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    /// Unix timestamp in seconds, fixed at stream start.
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

/// `{role:"assistant",content:<s>}` when content is non-empty, `{}` otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Error,
}

impl ChatCompletionChunk {
    fn new(id: &str, model: &str, created: u64, delta: ChunkDelta, finish: Option<FinishReason>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
        }
    }

    /// A chunk carrying assistant content, without a finish reason.
    pub fn content(id: &str, model: &str, created: u64, content: String) -> Self {
        Self::new(id, model, created, delta_for(content), None)
    }

    /// The terminal chunk. Content may be empty, in which case the delta is
    /// `{}`.
    pub fn finish(
        id: &str,
        model: &str,
        created: u64,
        content: String,
        reason: FinishReason,
    ) -> Self {
        Self::new(id, model, created, delta_for(content), Some(reason))
    }
}

fn delta_for(content: String) -> ChunkDelta {
    if content.is_empty() {
        ChunkDelta::default()
    } else {
        ChunkDelta {
            role: Some("assistant".to_string()),
            content: Some(content),
        }
    }
}

/// A non-streaming chat completion, as synthesised by the collector.
#[derive(Serialize, Debug, Clone)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatChoice {
    pub index: usize,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

impl ChatCompletion {
    pub fn assistant(model: &str, created: u64, content: String) -> Self {
        Self {
            id: new_completion_id(),
            object: "chat.completion",
            created,
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: FinishReason::Stop,
            }],
        }
    }
}

/// A fresh `chatcmpl-<uuid v4>` id.
pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// One frame of the output event stream.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Chunk(ChatCompletionChunk),
    Done,
}

impl SseEvent {
    /// Encode as a `data: …\n\n` server-sent-events frame.
    pub fn to_sse(&self) -> String {
        match self {
            // These shapes contain no map keys or non-finite floats, so
            // serialization cannot fail.
            SseEvent::Chunk(chunk) => format!(
                "data: {}\n\n",
                serde_json::to_string(chunk).unwrap_or_default()
            ),
            SseEvent::Done => "data: [DONE]\n\n".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_content_serialises_as_empty_delta() {
        let chunk = ChatCompletionChunk::finish("chatcmpl-x", "grok-3", 7, String::new(), FinishReason::Stop);
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(value["choices"][0]["finish_reason"], json!("stop"));
    }

    #[test]
    fn content_delta_carries_role() {
        let chunk = ChatCompletionChunk::content("chatcmpl-x", "grok-3", 7, "hi".to_string());
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            value["choices"][0]["delta"],
            json!({"role": "assistant", "content": "hi"})
        );
        assert_eq!(value["choices"][0]["finish_reason"], json!(null));
    }

    #[test]
    fn done_frame_encoding() {
        assert_eq!(SseEvent::Done.to_sse(), "data: [DONE]\n\n");
    }

    #[test]
    fn message_text_extraction() {
        let plain = MessageContent::Text("hello".to_string());
        assert_eq!(plain.extract_text(), "hello");

        let parts: MessageContent = serde_json::from_value(json!([
            {"type": "text", "text": "a"},
            {"type": "image_url"},
            {"type": "text", "text": "b"},
        ]))
        .unwrap();
        assert_eq!(parts.extract_text(), "ab");
    }
}
