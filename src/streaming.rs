//! The NDJSON→SSE stream transformer.
//!
//! One driver per request stream: it reads upstream line frames through an
//! incremental UTF-8 decoder, tracks conversation identity, brackets
//! chain-of-thought in `<think>` wrappers, folds tool-usage cards into
//! display lines, renders video and image terminals, and enforces the
//! three-tier timeout machine. Every stream ends with exactly one `[DONE]`
//! and exactly one `on_finish` callback, no matter how the upstream behaves.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
};

use crate::{
    assets::{normalize_asset_urls, proxy_asset_url},
    config::StreamSettings,
    format::{new_completion_id, ChatCompletionChunk, FinishReason, SseEvent},
    frame::{FrameView, VideoView},
    tool_cards::{ConsumeOptions, ParsedStream, ToolCardParser},
    ConversationMeta, StreamFinishResult, StreamHooks,
};

pub type SseSender = flume::Sender<SseEvent>;
pub type SseReceiver = flume::Receiver<SseEvent>;

/// Per-stream inputs assembled by the caller.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Model name reported in output chunks until the upstream names one.
    pub model: String,
    /// Resolved base URL for proxied asset paths.
    pub asset_base: String,
    pub settings: StreamSettings,
}

/// Drive an upstream NDJSON body to the SSE channel. The returned task owns
/// the whole lifecycle; dropping the receiver cancels output without
/// disturbing the final `on_finish`.
pub fn stream_ndjson_to_channel<S>(
    body: S,
    ctx: StreamContext,
    hooks: Box<dyn StreamHooks>,
    tx: SseSender,
) -> tokio::task::JoinHandle<()>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    tokio::task::spawn(async move {
        let mut driver = StreamDriver::new(ctx, hooks, tx);
        driver.run(body).await;
    })
}

/// Render a finished video as HTML, with both URLs rewritten through the
/// asset proxy.
pub(crate) fn render_video_html(
    asset_base: &str,
    url: &str,
    thumbnail: Option<&str>,
    poster_preview: bool,
) -> String {
    let src = proxy_asset_url(asset_base, url);
    let poster = thumbnail.map(|t| proxy_asset_url(asset_base, t));

    match (poster, poster_preview) {
        (Some(poster), true) => format!(
            "\n\n<a href=\"{src}\" target=\"_blank\"><img src=\"{poster}\" alt=\"Generated video poster\" /></a>\n\n"
        ),
        (Some(poster), false) => {
            format!("\n\n<video controls src=\"{src}\" poster=\"{poster}\"></video>\n\n")
        }
        (None, _) => format!("\n\n<video controls src=\"{src}\"></video>\n\n"),
    }
}

/// Render generated images as Markdown, one per line.
pub(crate) fn render_image_markdown(asset_base: &str, urls: &[String]) -> String {
    urls.iter()
        .map(|url| format!("![Generated Image]({})", proxy_asset_url(asset_base, url)))
        .join("\n")
}

enum Flow {
    Continue,
    Finished,
}

struct StreamDriver {
    tx: SseSender,
    hooks: Box<dyn StreamHooks>,
    settings: StreamSettings,
    asset_base: String,

    chunk_id: String,
    created: u64,
    model: String,

    meta: ConversationMeta,
    parser: ToolCardParser,
    filtered: Vec<String>,
    last_tool_rollout: Option<String>,

    thinking: bool,
    think_open: bool,
    video_think_open: bool,
    video_progress: u64,
    /// Most recent video URL (with optional poster) not yet rendered.
    pending_video: Option<(String, Option<String>)>,
    video_emitted: bool,
    image_mode: bool,

    first_received: bool,
    final_status: u16,
    started: tokio::time::Instant,
    closed: bool,
    finished: bool,
}

impl StreamDriver {
    fn new(ctx: StreamContext, hooks: Box<dyn StreamHooks>, tx: SseSender) -> Self {
        let filtered = ctx.settings.filtered_tag_list();
        Self {
            tx,
            hooks,
            filtered,
            settings: ctx.settings,
            asset_base: ctx.asset_base,
            chunk_id: new_completion_id(),
            created: chrono::Utc::now().timestamp() as u64,
            model: ctx.model,
            meta: ConversationMeta::default(),
            parser: ToolCardParser::new(),
            last_tool_rollout: None,
            thinking: false,
            think_open: false,
            video_think_open: false,
            video_progress: 0,
            pending_video: None,
            video_emitted: false,
            image_mode: false,
            first_received: false,
            final_status: 200,
            started: tokio::time::Instant::now(),
            closed: false,
            finished: false,
        }
    }

    async fn run<S>(&mut self, body: S)
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        let reader = StreamReader::new(Box::pin(body));
        let mut lines = FramedRead::new(reader, LinesCodec::new());

        loop {
            let next = match self.effective_timeout() {
                Some(limit) => match tokio::time::timeout(limit, lines.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        tracing::debug!(
                            first_received = self.first_received,
                            "stream timed out, terminating gracefully"
                        );
                        self.finish_stop().await;
                        return;
                    }
                },
                None => lines.next().await,
            };

            match next {
                None => {
                    self.finish_stop().await;
                    return;
                }
                Some(Err(err)) => {
                    self.finish_processing_error(&err.to_string()).await;
                    return;
                }
                Some(Ok(line)) => {
                    if let Flow::Finished = self.handle_line(&line).await {
                        return;
                    }
                }
            }

            if self.closed {
                // Client went away; release the upstream reader but still
                // report the finish once.
                self.call_finish().await;
                return;
            }
        }
    }

    /// Effective bound for the next read: first-byte or inter-chunk limit,
    /// capped by what remains of the total budget. Bounds set to zero are
    /// disabled.
    fn effective_timeout(&self) -> Option<Duration> {
        let per_read = if self.first_received {
            self.settings.chunk_timeout
        } else {
            self.settings.first_timeout
        };
        let per_read = (per_read > Duration::ZERO).then_some(per_read);

        let total_left = (self.settings.total_timeout > Duration::ZERO)
            .then(|| self.settings.total_timeout.saturating_sub(self.started.elapsed()));

        match (per_read, total_left) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            tracing::trace!(len = line.len(), "skipping unparseable frame");
            return Flow::Continue;
        };
        let frame = FrameView::new(&value);
        self.first_received = true;

        if self.meta.absorb(frame.conversation_id(), frame.last_response_id()) {
            let meta = self.meta.clone();
            self.hooks.on_meta(&meta).await;
        }

        if let Some(message) = frame.error_message() {
            tracing::warn!(error = message, "upstream reported an error frame");
            self.finish_upstream_error(message).await;
            return Flow::Finished;
        }

        let Some(grok) = frame.response() else {
            return Flow::Continue;
        };

        if let Some(model) = grok.user_response_model() {
            self.model = model.to_string();
        }

        if let Some(video) = grok.video() {
            self.handle_video(video).await;
            return Flow::Continue;
        }

        if grok.has_image_attachment() {
            self.image_mode = true;
        }
        if self.image_mode {
            if let Some(raw_urls) = grok.generated_image_urls() {
                let urls = normalize_asset_urls(raw_urls);
                if !urls.is_empty() {
                    self.finish_with_images(&urls).await;
                    return Flow::Finished;
                }
            }
            if let Some(token) = grok.token().filter(|t| !t.is_empty()) {
                let token = token.to_string();
                self.send_content(token).await;
            }
            return Flow::Continue;
        }

        self.thinking = grok.is_thinking();
        if let Some(rollout) = grok.rollout_id() {
            self.last_tool_rollout = Some(rollout.to_string());
        }

        let mut token = grok.token().unwrap_or("");
        if !token.is_empty() && self.filtered.iter().any(|tag| token.contains(tag.as_str())) {
            tracing::trace!("dropping token matching a filtered tag");
            token = "";
        }

        let opts = ConsumeOptions {
            emit_lines: self.settings.show_thinking && self.settings.show_search,
            fallback_rollout_id: self.last_tool_rollout.as_deref(),
        };
        let parsed = self.parser.consume(token, &opts);
        let header = grok.message_tag() == Some("header");
        self.emit_text_delta(parsed, header).await;
        Flow::Continue
    }

    async fn emit_text_delta(&mut self, parsed: ParsedStream, header: bool) {
        let mut out = String::new();

        if self.settings.show_thinking {
            if self.thinking && !self.think_open {
                out.push_str("<think>\n");
                self.think_open = true;
            } else if !self.thinking && self.think_open {
                out.push_str("\n</think>\n");
                self.think_open = false;
            }
        }

        if self.thinking && !self.settings.show_thinking {
            // Suppressed entirely; thinking state is still tracked above.
            return;
        }

        for line in &parsed.lines {
            out.push_str(line);
            out.push('\n');
        }

        if header && !parsed.text.is_empty() {
            out.push_str("\n\n");
            out.push_str(&parsed.text);
            out.push_str("\n\n");
        } else {
            out.push_str(&parsed.text);
        }

        if !out.is_empty() {
            self.send_content(out).await;
        }
    }

    async fn handle_video(&mut self, video: VideoView<'_>) {
        let progress = video.progress();
        if progress > self.video_progress {
            self.video_progress = progress;
            if self.settings.show_thinking {
                let line = if progress >= 100 {
                    if self.video_think_open {
                        self.video_think_open = false;
                        "视频已生成100%</think>\n".to_string()
                    } else {
                        "<think>视频已生成100%</think>\n".to_string()
                    }
                } else if self.video_think_open {
                    format!("视频已生成{progress}%\n")
                } else {
                    self.video_think_open = true;
                    format!("<think>视频已生成{progress}%\n")
                };
                self.send_content(line).await;
            }
        }

        if let Some(url) = video.video_url() {
            if !self.video_emitted {
                self.pending_video =
                    Some((url.to_string(), video.thumbnail_url().map(str::to_string)));
            }
        }

        // The rendered block follows the closed progress wrapper, so it waits
        // for completion; a stream that ends early still renders it at
        // termination.
        if self.video_progress >= 100 {
            if let Some(html) = self.take_pending_video_html() {
                self.send_content(html).await;
            }
        }
    }

    fn take_pending_video_html(&mut self) -> Option<String> {
        let (url, thumbnail) = self.pending_video.take()?;
        self.video_emitted = true;
        Some(render_video_html(
            &self.asset_base,
            &url,
            thumbnail.as_deref(),
            self.settings.video_poster_preview,
        ))
    }

    async fn finish_with_images(&mut self, urls: &[String]) {
        let markdown = render_image_markdown(&self.asset_base, urls);

        let mut content = self.close_wrappers();
        content.push_str(&markdown);
        self.send_finish(FinishReason::Stop, content).await;
        self.send_done().await;
        self.call_finish().await;
    }

    /// Normal termination: end of stream or a tripped timeout.
    async fn finish_stop(&mut self) {
        let mut content = self.residual_text();
        content.push_str(&self.close_wrappers());
        if let Some(html) = self.take_pending_video_html() {
            content.push_str(&html);
        }
        if !content.is_empty() {
            self.send_content(content).await;
        }

        self.send_finish(FinishReason::Stop, String::new()).await;
        self.send_done().await;
        self.call_finish().await;
    }

    /// The upstream sent an `error.message` frame.
    async fn finish_upstream_error(&mut self, message: &str) {
        self.final_status = 500;
        let mut content = self.residual_text();
        content.push_str(&self.close_wrappers());
        content.push_str("Error: ");
        content.push_str(message);

        self.send_finish(FinishReason::Stop, content).await;
        self.send_done().await;
        self.call_finish().await;
    }

    /// Decoding failed mid-stream.
    async fn finish_processing_error(&mut self, message: &str) {
        tracing::warn!(error = message, "stream processing failed");
        self.final_status = 500;
        let mut content = self.residual_text();
        content.push_str(&self.close_wrappers());
        content.push_str("处理错误: ");
        content.push_str(message);

        self.send_finish(FinishReason::Error, content).await;
        self.send_done().await;
        self.call_finish().await;
    }

    /// Flush the tool-card buffer, subject to the same thinking suppression
    /// as ordinary deltas.
    fn residual_text(&mut self) -> String {
        let opts = ConsumeOptions {
            emit_lines: self.settings.show_thinking && self.settings.show_search,
            fallback_rollout_id: self.last_tool_rollout.as_deref(),
        };
        let parsed = self.parser.flush(&opts, true);

        if self.thinking && !self.settings.show_thinking {
            return String::new();
        }

        let mut out = String::new();
        for line in &parsed.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&parsed.text);
        out
    }

    fn close_wrappers(&mut self) -> String {
        let mut out = String::new();
        if self.think_open {
            out.push_str("\n</think>\n");
            self.think_open = false;
        }
        if self.video_think_open {
            out.push_str("</think>\n");
            self.video_think_open = false;
        }
        out
    }

    async fn send_content(&mut self, content: String) {
        let chunk =
            ChatCompletionChunk::content(&self.chunk_id, &self.model, self.created, content);
        self.send_event(SseEvent::Chunk(chunk)).await;
    }

    async fn send_finish(&mut self, reason: FinishReason, content: String) {
        let chunk =
            ChatCompletionChunk::finish(&self.chunk_id, &self.model, self.created, content, reason);
        self.send_event(SseEvent::Chunk(chunk)).await;
    }

    async fn send_done(&mut self) {
        self.send_event(SseEvent::Done).await;
    }

    async fn send_event(&mut self, event: SseEvent) {
        if self.closed {
            return;
        }
        if self.tx.send_async(event).await.is_err() {
            tracing::debug!("output channel closed, dropping remaining stream output");
            self.closed = true;
        }
    }

    async fn call_finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let result = StreamFinishResult {
            status: self.final_status,
            duration: self.started.elapsed(),
            meta: self.meta.clone(),
        };
        self.hooks.on_finish(&result).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::assets::proxy_asset_url;

    const BASE: &str = "https://relay.example";

    #[derive(Default, Clone)]
    struct RecordingHooks {
        metas: Arc<Mutex<Vec<ConversationMeta>>>,
        finishes: Arc<Mutex<Vec<StreamFinishResult>>>,
    }

    #[async_trait::async_trait]
    impl StreamHooks for RecordingHooks {
        async fn on_meta(&mut self, meta: &ConversationMeta) {
            self.metas.lock().unwrap().push(meta.clone());
        }

        async fn on_finish(&mut self, result: &StreamFinishResult) {
            self.finishes.lock().unwrap().push(result.clone());
        }
    }

    fn no_timeouts(settings: &mut StreamSettings) {
        settings.first_timeout = Duration::ZERO;
        settings.chunk_timeout = Duration::ZERO;
        settings.total_timeout = Duration::ZERO;
    }

    fn body_of(frames: &[serde_json::Value]) -> String {
        frames.iter().map(|f| format!("{f}\n")).join("")
    }

    async fn run_chunks(
        chunks: Vec<Bytes>,
        settings: StreamSettings,
        hooks: RecordingHooks,
    ) -> Vec<SseEvent> {
        let ctx = StreamContext {
            model: "grok-3".to_string(),
            asset_base: BASE.to_string(),
            settings,
        };
        let (tx, rx) = flume::unbounded();
        let body = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let handle = stream_ndjson_to_channel(body, ctx, Box::new(hooks), tx);

        let mut events = Vec::new();
        while let Ok(event) = rx.recv_async().await {
            events.push(event);
        }
        handle.await.unwrap();
        events
    }

    async fn run_frames(
        frames: &[serde_json::Value],
        settings: StreamSettings,
        hooks: RecordingHooks,
    ) -> Vec<SseEvent> {
        run_chunks(vec![Bytes::from(body_of(frames))], settings, hooks).await
    }

    fn content_deltas(events: &[SseEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                SseEvent::Chunk(chunk) => chunk.choices[0].delta.content.clone(),
                SseEvent::Done => None,
            })
            .collect()
    }

    /// (delta content, finish reason) pairs plus DONE markers, for
    /// comparisons that must ignore the per-stream id and timestamp.
    fn shape(events: &[SseEvent]) -> Vec<(Option<String>, Option<FinishReason>)> {
        events
            .iter()
            .map(|event| match event {
                SseEvent::Chunk(chunk) => (
                    chunk.choices[0].delta.content.clone(),
                    chunk.choices[0].finish_reason,
                ),
                SseEvent::Done => (Some("[DONE]".to_string()), None),
            })
            .collect()
    }

    fn assert_single_done_last(events: &[SseEvent]) {
        let done_count = events
            .iter()
            .filter(|e| matches!(e, SseEvent::Done))
            .count();
        assert_eq!(done_count, 1);
        assert!(matches!(events.last(), Some(SseEvent::Done)));
    }

    fn assert_think_balanced(events: &[SseEvent]) {
        let text: String = content_deltas(events).join("");
        assert_eq!(text.matches("<think>").count(), text.matches("</think>").count());
    }

    #[tokio::test]
    async fn plain_text_with_think_wrap() {
        let mut settings = StreamSettings::default();
        settings.show_search = false;
        no_timeouts(&mut settings);

        let hooks = RecordingHooks::default();
        let events = run_frames(
            &[
                json!({"result": {"response": {"isThinking": true, "token": "hi"}}}),
                json!({"result": {"response": {"isThinking": false, "token": " world"}}}),
            ],
            settings,
            hooks.clone(),
        )
        .await;

        assert_eq!(
            content_deltas(&events),
            vec!["<think>\nhi".to_string(), "\n</think>\n world".to_string()]
        );
        assert_single_done_last(&events);
        assert_think_balanced(&events);

        let finishes = hooks.finishes.lock().unwrap();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].status, 200);
    }

    #[tokio::test]
    async fn thinking_suppressed_when_disabled() {
        let mut settings = StreamSettings::default();
        settings.show_thinking = false;
        no_timeouts(&mut settings);

        let events = run_frames(
            &[
                json!({"result": {"response": {"isThinking": true, "token": "secret"}}}),
                json!({"result": {"response": {"isThinking": false, "token": "visible"}}}),
            ],
            settings,
            RecordingHooks::default(),
        )
        .await;

        assert_eq!(content_deltas(&events), vec!["visible".to_string()]);
        assert_single_done_last(&events);
    }

    #[tokio::test]
    async fn image_terminal_emits_single_markdown_chunk() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let hooks = RecordingHooks::default();
        let events = run_frames(
            &[
                json!({"result": {"response": {"imageAttachmentInfo": {}}}}),
                json!({"result": {"response": {"modelResponse": {"generatedImageUrls": ["https://x/y.png"]}}}}),
            ],
            settings,
            hooks.clone(),
        )
        .await;

        let expected = format!("![Generated Image]({})", proxy_asset_url(BASE, "https://x/y.png"));
        let shapes = shape(&events);
        assert_eq!(
            shapes,
            vec![
                (Some(expected), Some(FinishReason::Stop)),
                (Some("[DONE]".to_string()), None),
            ]
        );
        assert_eq!(hooks.finishes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn video_poster_preview_flow() {
        let mut settings = StreamSettings::default();
        settings.video_poster_preview = true;
        no_timeouts(&mut settings);

        let video = |progress: u64| {
            json!({"result": {"response": {"streamingVideoGenerationResponse": {
                "progress": progress,
                "videoUrl": "https://v/a.mp4",
                "thumbnailImageUrl": "https://v/a.jpg",
            }}}})
        };

        let events = run_frames(
            &[video(50), video(100)],
            settings,
            RecordingHooks::default(),
        )
        .await;

        let src = proxy_asset_url(BASE, "https://v/a.mp4");
        let poster = proxy_asset_url(BASE, "https://v/a.jpg");
        assert_eq!(
            content_deltas(&events),
            vec![
                "<think>视频已生成50%\n".to_string(),
                "视频已生成100%</think>\n".to_string(),
                format!(
                    "\n\n<a href=\"{src}\" target=\"_blank\"><img src=\"{poster}\" alt=\"Generated video poster\" /></a>\n\n"
                ),
            ]
        );
        assert_single_done_last(&events);
        assert_think_balanced(&events);
    }

    #[tokio::test]
    async fn video_without_completion_renders_at_end() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let events = run_frames(
            &[json!({"result": {"response": {"streamingVideoGenerationResponse": {
                "progress": 40,
                "videoUrl": "https://v/b.mp4",
            }}}})],
            settings,
            RecordingHooks::default(),
        )
        .await;

        let src = proxy_asset_url(BASE, "https://v/b.mp4");
        assert_eq!(
            content_deltas(&events),
            vec![
                "<think>视频已生成40%\n".to_string(),
                format!("</think>\n\n\n<video controls src=\"{src}\"></video>\n\n"),
            ]
        );
        assert_single_done_last(&events);
        assert_think_balanced(&events);
    }

    #[tokio::test]
    async fn upstream_error_frame_finishes_with_stop() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let hooks = RecordingHooks::default();
        let events = run_frames(
            &[json!({"error": {"message": "quota exhausted"}})],
            settings,
            hooks.clone(),
        )
        .await;

        let shapes = shape(&events);
        assert_eq!(
            shapes,
            vec![
                (
                    Some("Error: quota exhausted".to_string()),
                    Some(FinishReason::Stop)
                ),
                (Some("[DONE]".to_string()), None),
            ]
        );

        let finishes = hooks.finishes.lock().unwrap();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].status, 500);
    }

    #[tokio::test]
    async fn meta_reported_monotonically() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let hooks = RecordingHooks::default();
        run_frames(
            &[
                json!({"result": {"conversation": {"conversationId": "c1"}}}),
                json!({"result": {"conversation": {"conversationId": "c1"}, "response": {"responseId": "r1", "token": "x"}}}),
                json!({"result": {"response": {"responseId": "r2", "token": "y"}}}),
            ],
            settings,
            hooks.clone(),
        )
        .await;

        let metas = hooks.metas.lock().unwrap();
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].grok_conversation_id, "c1");
        assert_eq!(metas[1].last_response_id, "r1");
        assert_eq!(metas[2].last_response_id, "r2");
        assert_eq!(metas[2].grok_conversation_id, "c1");
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let body = format!(
            "not json\n{}\n{{\"truncated\": \n",
            json!({"result": {"response": {"token": "ok"}}})
        );
        let events = run_chunks(
            vec![Bytes::from(body)],
            settings,
            RecordingHooks::default(),
        )
        .await;

        assert_eq!(content_deltas(&events), vec!["ok".to_string()]);
        assert_single_done_last(&events);
    }

    #[tokio::test]
    async fn filtered_tags_drop_whole_token() {
        let mut settings = StreamSettings::default();
        settings.filtered_tags = "<summary>".to_string();
        no_timeouts(&mut settings);

        let events = run_frames(
            &[
                json!({"result": {"response": {"token": "keep"}}}),
                json!({"result": {"response": {"token": "a <summary>hidden</summary> b"}}}),
                json!({"result": {"response": {"token": " kept"}}}),
            ],
            settings,
            RecordingHooks::default(),
        )
        .await;

        assert_eq!(
            content_deltas(&events),
            vec!["keep".to_string(), " kept".to_string()]
        );
    }

    #[tokio::test]
    async fn tool_card_lines_replace_card_text() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let card = concat!(
            "<xai:tool_usage_card><xai:tool_name>web_search</xai:tool_name>",
            "<xai:tool_args><![CDATA[{\"query\":\"foo\"}]]></xai:tool_args></xai:tool_usage_card>",
        );
        let events = run_frames(
            &[
                json!({"result": {"response": {"rolloutId": "r1", "token": &card[..40]}}}),
                json!({"result": {"response": {"token": &card[40..]}}}),
            ],
            settings,
            RecordingHooks::default(),
        )
        .await;

        assert_eq!(content_deltas(&events), vec!["[r1][WebSearch] foo\n".to_string()]);
    }

    #[tokio::test]
    async fn output_is_invariant_under_chunk_splits() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let frames = [
            json!({"result": {"response": {"isThinking": true, "token": "思考中"}}}),
            json!({"result": {"response": {"isThinking": false, "token": "答案是 42"}}}),
        ];
        let body = body_of(&frames);
        let whole = run_chunks(
            vec![Bytes::from(body.clone())],
            settings.clone(),
            RecordingHooks::default(),
        )
        .await;

        // Split at every byte offset, including inside multi-byte characters.
        let raw = body.as_bytes();
        for split in 1..raw.len() {
            let chunks = vec![
                Bytes::copy_from_slice(&raw[..split]),
                Bytes::copy_from_slice(&raw[split..]),
            ];
            let split_events =
                run_chunks(chunks, settings.clone(), RecordingHooks::default()).await;
            assert_eq!(shape(&split_events), shape(&whole), "split at byte {split}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out_gracefully() {
        let mut settings = StreamSettings::default();
        settings.first_timeout = Duration::from_millis(50);
        settings.chunk_timeout = Duration::from_millis(50);
        settings.total_timeout = Duration::ZERO;

        let frame = Bytes::from(format!(
            "{}\n",
            json!({"result": {"response": {"token": "partial"}}})
        ));
        let body = stream::iter(vec![Ok::<_, std::io::Error>(frame)]).chain(stream::pending());

        let ctx = StreamContext {
            model: "grok-3".to_string(),
            asset_base: BASE.to_string(),
            settings,
        };
        let hooks = RecordingHooks::default();
        let (tx, rx) = flume::unbounded();
        let handle = stream_ndjson_to_channel(body, ctx, Box::new(hooks.clone()), tx);

        let mut events = Vec::new();
        while let Ok(event) = rx.recv_async().await {
            events.push(event);
        }
        handle.await.unwrap();

        assert_eq!(content_deltas(&events), vec!["partial".to_string()]);
        assert_single_done_last(&events);

        let finishes = hooks.finishes.lock().unwrap();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].status, 200, "timeout is not a client-visible error");
    }

    #[tokio::test]
    async fn dropped_receiver_still_reports_finish() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let ctx = StreamContext {
            model: "grok-3".to_string(),
            asset_base: BASE.to_string(),
            settings,
        };
        let hooks = RecordingHooks::default();
        let (tx, rx) = flume::bounded(0);
        drop(rx);

        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(format!(
            "{}\n",
            json!({"result": {"response": {"token": "x"}}})
        )))]);
        let handle = stream_ndjson_to_channel(body, ctx, Box::new(hooks.clone()), tx);
        handle.await.unwrap();

        assert_eq!(hooks.finishes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn header_tag_pads_body_text() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let events = run_frames(
            &[json!({"result": {"response": {"token": "Chapter One", "messageTag": "header"}}})],
            settings,
            RecordingHooks::default(),
        )
        .await;

        assert_eq!(
            content_deltas(&events),
            vec!["\n\nChapter One\n\n".to_string()]
        );
    }

    #[tokio::test]
    async fn model_adopted_from_user_response() {
        let mut settings = StreamSettings::default();
        no_timeouts(&mut settings);

        let events = run_frames(
            &[
                json!({"result": {"response": {"userResponse": {"model": "grok-4"}, "token": ""}}}),
                json!({"result": {"response": {"token": "hi"}}}),
            ],
            settings,
            RecordingHooks::default(),
        )
        .await;

        let SseEvent::Chunk(chunk) = &events[0] else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.model, "grok-4");
    }
}
