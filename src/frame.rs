//! Typed view over one upstream NDJSON frame.
//!
//! The upstream stream is effectively schemaless; frames are kept as
//! `serde_json::Value` and read through conditional accessors instead of a
//! fixed record, so absent or novel fields cost nothing.

use serde_json::Value;

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_str()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// One parsed NDJSON frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a>(&'a Value);

impl<'a> FrameView<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self(value)
    }

    /// Top-level `error.message`.
    pub fn error_message(&self) -> Option<&'a str> {
        str_at(self.0, &["error", "message"])
    }

    /// `result.conversation.conversationId`.
    pub fn conversation_id(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["result", "conversation", "conversationId"]))
    }

    /// The upstream continuation cursor, read from the known locations in
    /// preference order.
    pub fn last_response_id(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["result", "response", "responseId"]))
            .or_else(|| {
                non_empty(str_at(
                    self.0,
                    &["result", "response", "modelResponse", "responseId"],
                ))
            })
            .or_else(|| non_empty(str_at(self.0, &["result", "modelResponse", "responseId"])))
            .or_else(|| non_empty(str_at(self.0, &["result", "userResponse", "responseId"])))
    }

    /// `result.response`, when present.
    pub fn response(&self) -> Option<ResponseView<'a>> {
        self.0.get("result")?.get("response").map(ResponseView)
    }
}

/// View over `result.response`.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a>(&'a Value);

impl<'a> ResponseView<'a> {
    /// The token delta, only when it is actually a string.
    pub fn token(&self) -> Option<&'a str> {
        self.0.get("token").and_then(Value::as_str)
    }

    pub fn is_thinking(&self) -> bool {
        self.0
            .get("isThinking")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn message_tag(&self) -> Option<&'a str> {
        self.0.get("messageTag").and_then(Value::as_str)
    }

    /// `rolloutId`, falling back to `toolUsageCardId`.
    pub fn rollout_id(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["rolloutId"]))
            .or_else(|| non_empty(str_at(self.0, &["toolUsageCardId"])))
    }

    /// `userResponse.model`, when it is a non-empty string.
    pub fn user_response_model(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["userResponse", "model"]))
    }

    pub fn model_response_message(&self) -> Option<&'a str> {
        str_at(self.0, &["modelResponse", "message"])
    }

    pub fn model_response_error(&self) -> Option<&'a str> {
        str_at(self.0, &["modelResponse", "error"])
    }

    /// `modelResponse.generatedImageUrls` as a raw value list.
    pub fn generated_image_urls(&self) -> Option<&'a Vec<Value>> {
        self.0
            .get("modelResponse")?
            .get("generatedImageUrls")?
            .as_array()
    }

    /// Whether this frame announces an image-generation response.
    pub fn has_image_attachment(&self) -> bool {
        self.0.get("imageAttachmentInfo").is_some()
    }

    pub fn video(&self) -> Option<VideoView<'a>> {
        self.0.get("streamingVideoGenerationResponse").map(VideoView)
    }
}

/// View over `streamingVideoGenerationResponse`.
#[derive(Debug, Clone, Copy)]
pub struct VideoView<'a>(&'a Value);

impl<'a> VideoView<'a> {
    /// Generation progress percentage, defaulting to zero.
    pub fn progress(&self) -> u64 {
        self.0.get("progress").and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn video_url(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["videoUrl"]))
    }

    pub fn thumbnail_url(&self) -> Option<&'a str> {
        non_empty(str_at(self.0, &["thumbnailImageUrl"]))
    }
}
