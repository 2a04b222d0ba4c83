//! Non-streaming collection: consume the whole NDJSON body and fold it into
//! one chat completion.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
};

use crate::{
    assets::normalize_asset_urls,
    format::ChatCompletion,
    frame::FrameView,
    streaming::{render_image_markdown, render_video_html, StreamContext},
    tool_cards::{replace_tool_usage_cards_in_text, ConsumeOptions},
    ConversationMeta, Error, StreamFinishResult, StreamHooks,
};

/// Consume an entire upstream NDJSON body and synthesise a single chat
/// completion. Conversation identity still flows through `on_meta`, and
/// `on_finish` fires exactly once.
pub async fn collect_response<S>(
    body: S,
    ctx: StreamContext,
    mut hooks: Box<dyn StreamHooks>,
) -> Result<ChatCompletion, Report<Error>>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    let started = tokio::time::Instant::now();
    let mut collector = Collector::new(&ctx);

    let reader = StreamReader::new(Box::pin(body));
    let mut lines = FramedRead::new(reader, LinesCodec::new());

    let mut failure: Option<String> = None;
    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(err) => {
                failure = Some(err.to_string());
                break;
            }
        };

        match collector.handle_line(&line, &mut hooks).await {
            Ok(()) => {}
            Err(message) => {
                failure = Some(message);
                break;
            }
        }
    }

    let status = if failure.is_some() { 500 } else { 200 };
    hooks
        .on_finish(&StreamFinishResult {
            status,
            duration: started.elapsed(),
            meta: collector.meta.clone(),
        })
        .await;

    if let Some(message) = failure {
        return Err(Report::new(Error::Upstream(message)))
            .attach_printable("collecting non-streaming response");
    }

    let created = chrono::Utc::now().timestamp() as u64;
    let model = collector.model.clone();
    Ok(ChatCompletion::assistant(
        &model,
        created,
        collector.into_content(),
    ))
}

struct Collector {
    model: String,
    asset_base: String,
    emit_lines: bool,
    poster_preview: bool,
    filtered: Vec<String>,
    meta: ConversationMeta,
    last_tool_rollout: Option<String>,

    token_parts: Vec<String>,
    latest_message: String,
    latest_tool_lines: Vec<String>,
    merged_content: Option<String>,
}

impl Collector {
    fn new(ctx: &StreamContext) -> Self {
        Self {
            model: ctx.model.clone(),
            asset_base: ctx.asset_base.clone(),
            emit_lines: ctx.settings.show_thinking && ctx.settings.show_search,
            poster_preview: ctx.settings.video_poster_preview,
            filtered: ctx.settings.filtered_tag_list(),
            meta: ConversationMeta::default(),
            last_tool_rollout: None,
            token_parts: Vec::new(),
            latest_message: String::new(),
            latest_tool_lines: Vec::new(),
            merged_content: None,
        }
    }

    /// Process one frame. An `Err` carries the upstream failure message.
    async fn handle_line(
        &mut self,
        line: &str,
        hooks: &mut Box<dyn StreamHooks>,
    ) -> Result<(), String> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            tracing::trace!(len = line.len(), "skipping unparseable frame");
            return Ok(());
        };
        let frame = FrameView::new(&value);

        if self.meta.absorb(frame.conversation_id(), frame.last_response_id()) {
            let meta = self.meta.clone();
            hooks.on_meta(&meta).await;
        }

        if let Some(message) = frame.error_message() {
            return Err(message.to_string());
        }

        let Some(grok) = frame.response() else {
            return Ok(());
        };

        if let Some(message) = grok.model_response_error() {
            return Err(message.to_string());
        }

        if let Some(model) = grok.user_response_model() {
            self.model = model.to_string();
        }

        if let Some(rollout) = grok.rollout_id() {
            self.last_tool_rollout = Some(rollout.to_string());
        }

        if let Some(video) = grok.video() {
            if let Some(url) = video.video_url() {
                self.merged_content = Some(render_video_html(
                    &self.asset_base,
                    url,
                    video.thumbnail_url(),
                    self.poster_preview,
                ));
            }
            return Ok(());
        }

        if let Some(raw_urls) = grok.generated_image_urls() {
            let urls = normalize_asset_urls(raw_urls);
            if !urls.is_empty() {
                self.merged_content = Some(render_image_markdown(&self.asset_base, &urls));
            }
        }

        if let Some(message) = grok.model_response_message() {
            let parsed = replace_tool_usage_cards_in_text(message, &self.consume_opts());
            self.latest_message = parsed.text;
            self.latest_tool_lines = parsed.lines.into_vec();
        }

        if let Some(token) = grok.token().filter(|t| !t.is_empty()) {
            if !self.filtered.iter().any(|tag| token.contains(tag.as_str())) {
                self.token_parts.push(token.to_string());
            }
        }

        Ok(())
    }

    fn consume_opts(&self) -> ConsumeOptions<'_> {
        ConsumeOptions {
            emit_lines: self.emit_lines,
            fallback_rollout_id: self.last_tool_rollout.as_deref(),
        }
    }

    /// Fold the tracked pieces into the final message content: merged
    /// terminal, else the latest full message, else the concatenated token
    /// parts; tool lines become a leading think block.
    fn into_content(mut self) -> String {
        let mut body = match self.merged_content.take() {
            Some(merged) => merged,
            None => self.latest_message.clone(),
        };

        if body.is_empty() && !self.token_parts.is_empty() {
            let joined = self.token_parts.concat();
            let parsed = replace_tool_usage_cards_in_text(&joined, &self.consume_opts());
            body = parsed.text;
            if self.latest_tool_lines.is_empty() {
                self.latest_tool_lines = parsed.lines.into_vec();
            }
        }

        if self.latest_tool_lines.is_empty() {
            return body;
        }

        let lines = self.latest_tool_lines.join("\n");
        if body.is_empty() {
            format!("<think>\n{lines}\n</think>")
        } else {
            format!("<think>\n{lines}\n</think>\n{body}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::stream;
    use itertools::Itertools;
    use serde_json::json;

    use super::*;
    use crate::{assets::proxy_asset_url, config::StreamSettings};

    const BASE: &str = "https://relay.example";

    #[derive(Default, Clone)]
    struct RecordingHooks {
        finishes: Arc<Mutex<Vec<StreamFinishResult>>>,
    }

    #[async_trait::async_trait]
    impl StreamHooks for RecordingHooks {
        async fn on_finish(&mut self, result: &StreamFinishResult) {
            self.finishes.lock().unwrap().push(result.clone());
        }
    }

    fn ctx() -> StreamContext {
        StreamContext {
            model: "grok-3".to_string(),
            asset_base: BASE.to_string(),
            settings: StreamSettings::default(),
        }
    }

    async fn collect(
        frames: &[serde_json::Value],
        hooks: RecordingHooks,
    ) -> Result<ChatCompletion, Report<Error>> {
        let body = frames.iter().map(|f| format!("{f}\n")).join("");
        let stream = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);
        collect_response(stream, ctx(), Box::new(hooks)).await
    }

    #[tokio::test]
    async fn token_parts_fold_when_no_message() {
        let hooks = RecordingHooks::default();
        let completion = collect(
            &[
                json!({"result": {"response": {"token": "hel"}}}),
                json!({"result": {"response": {"token": "lo"}}}),
            ],
            hooks.clone(),
        )
        .await
        .unwrap();

        assert_eq!(completion.choices[0].message.content, "hello");
        assert_eq!(completion.choices[0].message.role, "assistant");

        let finishes = hooks.finishes.lock().unwrap();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].status, 200);
    }

    #[tokio::test]
    async fn latest_message_wins_over_tokens() {
        let completion = collect(
            &[
                json!({"result": {"response": {"token": "partial"}}}),
                json!({"result": {"response": {"modelResponse": {"message": "the full answer"}}}}),
            ],
            RecordingHooks::default(),
        )
        .await
        .unwrap();

        assert_eq!(completion.choices[0].message.content, "the full answer");
    }

    #[tokio::test]
    async fn tool_lines_become_a_leading_think_block() {
        let card = concat!(
            "<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name>",
            "<xai:tool_args><![CDATA[{\"query\":\"foo\"}]]></xai:tool_args></xai:tool_usage_card>",
        );
        let message = format!("{card}answer");
        let completion = collect(
            &[json!({"result": {"response": {
                "rolloutId": "r1",
                "modelResponse": {"message": message},
            }}})],
            RecordingHooks::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            completion.choices[0].message.content,
            "<think>\n[r1][WebSearch] foo\n</think>\nanswer"
        );
    }

    #[tokio::test]
    async fn image_terminal_overrides_message() {
        let completion = collect(
            &[
                json!({"result": {"response": {"modelResponse": {"message": "drawing..."}}}}),
                json!({"result": {"response": {"modelResponse": {"generatedImageUrls": ["https://x/y.png"]}}}}),
            ],
            RecordingHooks::default(),
        )
        .await
        .unwrap();

        let expected = format!("![Generated Image]({})", proxy_asset_url(BASE, "https://x/y.png"));
        assert_eq!(completion.choices[0].message.content, expected);
    }

    #[tokio::test]
    async fn model_response_error_fails_collection() {
        let hooks = RecordingHooks::default();
        let err = collect(
            &[json!({"result": {"response": {"modelResponse": {"error": "blocked"}}}})],
            hooks.clone(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.current_context(), Error::Upstream(m) if m == "blocked"));
        assert_eq!(hooks.finishes.lock().unwrap()[0].status, 500);
    }

    #[tokio::test]
    async fn root_error_frame_fails_collection() {
        let err = collect(
            &[json!({"error": {"message": "boom"}})],
            RecordingHooks::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err.current_context(), Error::Upstream(m) if m == "boom"));
    }

    #[tokio::test]
    async fn video_terminal_is_rendered() {
        let completion = collect(
            &[json!({"result": {"response": {"streamingVideoGenerationResponse": {
                "progress": 100,
                "videoUrl": "https://v/a.mp4",
            }}}})],
            RecordingHooks::default(),
        )
        .await
        .unwrap();

        let src = proxy_asset_url(BASE, "https://v/a.mp4");
        assert_eq!(
            completion.choices[0].message.content,
            format!("\n\n<video controls src=\"{src}\"></video>\n\n")
        );
    }
}
