//! Incremental extraction of pseudo-XML tool-usage cards from the upstream
//! token stream.
//!
//! Tokens arrive split at arbitrary boundaries, so a card's opening tag, its
//! CDATA payload and its closing tag may be spread over many deltas. The
//! parser keeps a single text buffer: complete cards are cut out and turned
//! into display lines, surrounding text passes through untouched, and a
//! possibly-partial opening tag at the end of the buffer is retained until
//! more input arrives.

use serde_json::Value;
use smallvec::SmallVec;

const OPEN_CARD: &str = "<xai:tool_usage_card";
const CLOSE_CARD: &str = "</xai:tool_usage_card>";
const OPEN_NAME: &str = "<xai:tool_name>";
const CLOSE_NAME: &str = "</xai:tool_name>";
const OPEN_ARGS: &str = "<xai:tool_args>";
const CLOSE_ARGS: &str = "</xai:tool_args>";
const PARTIAL_OPEN: &str = "<xai:";

/// How far back from the end of the buffer a partial opening tag is looked
/// for.
const TAIL_WINDOW: usize = 64;

/// How deep the argument payload is searched for rollout ids and content.
const ARGS_MAX_DEPTH: usize = 6;

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Keys that identify rather than describe a tool invocation; skipped when
/// falling back to "any scalar" content extraction.
const METADATA_KEYS: &[&str] = &[
    "rolloutid",
    "rollout",
    "id",
    "type",
    "tool",
    "toolname",
    "cardid",
    "toolusagecardid",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCardKind {
    WebSearch,
    SearchImage,
    AgentThink,
    Unknown,
    Other(String),
}

impl ToolCardKind {
    fn from_name(name: &str) -> Self {
        if name.is_empty() {
            return ToolCardKind::Unknown;
        }

        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "web_search" | "websearch" => ToolCardKind::WebSearch,
            "search_image" | "search_images" | "image_search" => ToolCardKind::SearchImage,
            "agent_think" | "chatroom_send" => ToolCardKind::AgentThink,
            _ => ToolCardKind::Other(name.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ToolCardKind::WebSearch => "WebSearch",
            ToolCardKind::SearchImage => "SearchImage",
            ToolCardKind::AgentThink => "AgentThink",
            ToolCardKind::Unknown => "Unknown",
            ToolCardKind::Other(name) => name,
        }
    }

    fn preferred_content_keys(&self) -> &'static [&'static str] {
        match self {
            ToolCardKind::WebSearch => {
                &["query", "queries", "keyword", "keywords", "prompt", "text"]
            }
            ToolCardKind::SearchImage => &["query", "prompt", "description", "keywords", "text"],
            ToolCardKind::AgentThink => &[
                "thought",
                "reason",
                "reasoning",
                "content",
                "text",
                "summary",
                "plan",
            ],
            ToolCardKind::Unknown | ToolCardKind::Other(_) => {
                &["content", "text", "query", "prompt", "message"]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUsageCard {
    pub rollout_id: String,
    pub kind: ToolCardKind,
    pub content: String,
}

/// Options for one `consume` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions<'a> {
    /// Emit display lines for parsed cards. When false, cards are dropped
    /// silently.
    pub emit_lines: bool,
    /// Rollout id used when the card's arguments do not carry one.
    pub fallback_rollout_id: Option<&'a str>,
}

/// Output of a `consume` or `flush` call: pass-through text plus display
/// lines for any cards parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStream {
    pub text: String,
    pub lines: SmallVec<[String; 2]>,
}

#[derive(Debug, Default)]
pub struct ToolCardParser {
    buffer: String,
}

impl ToolCardParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `input` to the buffer and extract whatever is complete.
    pub fn consume(&mut self, input: &str, opts: &ConsumeOptions) -> ParsedStream {
        self.buffer.push_str(input);
        let mut out = ParsedStream::default();

        loop {
            let card_at = find_ascii_ci(&self.buffer, OPEN_CARD, 0);
            let name_at = find_ascii_ci(&self.buffer, OPEN_NAME, 0);
            let start = match (card_at, name_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let Some(start) = start else {
                // No opening tag. Keep a possible partial open at the tail,
                // flush the rest as text.
                let tail_from = self.buffer.len().saturating_sub(TAIL_WINDOW);
                let keep = rfind_ascii_ci(&self.buffer, PARTIAL_OPEN, tail_from)
                    .unwrap_or_else(|| partial_open_suffix(&self.buffer));
                out.text.push_str(&self.buffer[..keep]);
                self.buffer.drain(..keep);
                break;
            };

            if start > 0 {
                out.text.push_str(&self.buffer[..start]);
                self.buffer.drain(..start);
                continue;
            }

            let Some(end) = self.complete_fragment_end(card_at == Some(0)) else {
                // Opening tag without its closing counterpart yet; wait.
                break;
            };

            let fragment: String = self.buffer.drain(..end).collect();
            match parse_fragment(&fragment, opts.fallback_rollout_id) {
                Some(card) => {
                    if opts.emit_lines {
                        push_card_lines(&card, &mut out.lines);
                    }
                }
                None => out.text.push_str(&fragment),
            }
        }

        out
    }

    /// Run one empty consume; optionally append whatever incomplete fragment
    /// remains as plain text.
    pub fn flush(&mut self, opts: &ConsumeOptions, emit_incomplete_as_text: bool) -> ParsedStream {
        let mut out = self.consume("", opts);
        if emit_incomplete_as_text && !self.buffer.is_empty() {
            out.text.push_str(&self.buffer);
            self.buffer.clear();
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// End offset of the complete fragment starting at buffer position 0, if
    /// its closing tags have arrived.
    fn complete_fragment_end(&self, starts_with_card: bool) -> Option<usize> {
        if starts_with_card {
            return find_ascii_ci(&self.buffer, CLOSE_CARD, 0).map(|at| at + CLOSE_CARD.len());
        }

        // Bare <xai:tool_name> form: name close, then args close, then an
        // optional trailing card close after whitespace.
        let name_close = find_ascii_ci(&self.buffer, CLOSE_NAME, 0)?;
        let args_close =
            find_ascii_ci(&self.buffer, CLOSE_ARGS, name_close + CLOSE_NAME.len())?;
        let mut end = args_close + CLOSE_ARGS.len();

        let rest = &self.buffer[end..];
        let ws = rest.len() - rest.trim_start().len();
        if find_ascii_ci(&rest[ws..], CLOSE_CARD, 0) == Some(0) {
            end += ws + CLOSE_CARD.len();
        }

        Some(end)
    }
}

/// One-shot helper: consume the whole input and flush, with incomplete
/// fragments re-emitted as text.
pub fn replace_tool_usage_cards_in_text(input: &str, opts: &ConsumeOptions) -> ParsedStream {
    let mut parser = ToolCardParser::new();
    let mut out = parser.consume(input, opts);
    let flushed = parser.flush(opts, true);
    out.text.push_str(&flushed.text);
    out.lines.extend(flushed.lines);
    out
}

fn push_card_lines(card: &ToolUsageCard, lines: &mut SmallVec<[String; 2]>) {
    let prefix = format!("[{}][{}]", card.rollout_id, card.kind.label());
    if card.content.is_empty() {
        lines.push(prefix);
        return;
    }

    for line in card.content.lines().filter(|line| !line.trim().is_empty()) {
        lines.push(format!("{prefix} {line}"));
    }
}

fn parse_fragment(fragment: &str, fallback_rollout: Option<&str>) -> Option<ToolUsageCard> {
    let name = extract_between_ci(fragment, OPEN_NAME, CLOSE_NAME)
        .map(|raw| strip_cdata(raw.trim()).trim().to_string());
    let args_raw = extract_between_ci(fragment, OPEN_ARGS, CLOSE_ARGS)
        .map(|raw| strip_cdata(raw.trim()).to_string());

    if name.is_none() && args_raw.is_none() {
        return None;
    }

    let kind = ToolCardKind::from_name(name.as_deref().unwrap_or(""));
    let parsed_args: Option<Value> = args_raw
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    let rollout_id = parsed_args
        .as_ref()
        .and_then(|args| find_rollout_id(args, 0))
        .or_else(|| fallback_rollout.map(str::to_string))
        .unwrap_or_else(|| "-".to_string());

    let content = match &parsed_args {
        Some(args) => extract_content(args, &kind).unwrap_or_default(),
        None => args_raw.unwrap_or_default(),
    };

    Some(ToolUsageCard {
        rollout_id,
        kind,
        content: normalize_content(&content),
    })
}

fn find_rollout_id(value: &Value, depth: usize) -> Option<String> {
    if depth > ARGS_MAX_DEPTH {
        return None;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let nk = normalize_key(key);
                if (nk == "rolloutid" || nk == "rollout") && is_scalar(child) {
                    return Some(scalar_to_string(child));
                }
            }
            map.values().find_map(|child| find_rollout_id(child, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|item| find_rollout_id(item, depth + 1)),
        _ => None,
    }
}

fn extract_content(args: &Value, kind: &ToolCardKind) -> Option<String> {
    for key in kind.preferred_content_keys() {
        if let Some(found) = find_by_key(args, key, 0) {
            return Some(found);
        }
    }

    first_non_metadata_scalar(args, 0)
}

fn find_by_key(value: &Value, wanted: &str, depth: usize) -> Option<String> {
    if depth > ARGS_MAX_DEPTH {
        return None;
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if normalize_key(key) == wanted {
                    if let Some(text) = value_text(child) {
                        return Some(text);
                    }
                }
            }
            map.values().find_map(|child| find_by_key(child, wanted, depth + 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|item| find_by_key(item, wanted, depth + 1)),
        _ => None,
    }
}

fn first_non_metadata_scalar(value: &Value, depth: usize) -> Option<String> {
    if depth > ARGS_MAX_DEPTH {
        return None;
    }

    match value {
        Value::Object(map) => map.iter().find_map(|(key, child)| {
            if is_scalar(child) {
                let nk = normalize_key(key);
                (!METADATA_KEYS.contains(&nk.as_str())).then(|| scalar_to_string(child))
            } else {
                first_non_metadata_scalar(child, depth + 1)
            }
        }),
        Value::Array(items) => items
            .iter()
            .find_map(|item| first_non_metadata_scalar(item, depth + 1)),
        _ => None,
    }
}

/// Scalar values render directly; arrays of scalars join line-per-item.
fn value_text(value: &Value) -> Option<String> {
    if is_scalar(value) {
        return Some(scalar_to_string(value));
    }

    if let Value::Array(items) = value {
        let parts: Vec<String> = items
            .iter()
            .filter(|item| is_scalar(item))
            .map(scalar_to_string)
            .collect();
        if !parts.is_empty() {
            return Some(parts.join("\n"));
        }
    }

    None
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::String(_) | Value::Number(_) | Value::Bool(_)
    )
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn normalize_content(content: &str) -> String {
    content.replace("\r\n", "\n").trim().to_string()
}

fn strip_cdata(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(inner) = trimmed.strip_prefix(CDATA_OPEN) {
        if let Some(inner) = inner.strip_suffix(CDATA_CLOSE) {
            return inner;
        }
    }
    trimmed
}

fn extract_between_ci<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let open_at = find_ascii_ci(haystack, open, 0)?;
    let inner_start = open_at + open.len();
    let close_at = find_ascii_ci(haystack, close, inner_start)?;
    Some(&haystack[inner_start..close_at])
}

/// ASCII case-insensitive substring search. All needles are ASCII, so byte
/// offsets returned here are always char boundaries in the haystack.
fn find_ascii_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }

    (from..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Start offset of a bare prefix of `<xai:` at the very end of the buffer,
/// or the buffer length when there is none. A token may split anywhere,
/// including inside the marker itself.
fn partial_open_suffix(buffer: &str) -> usize {
    let bytes = buffer.as_bytes();
    let max = PARTIAL_OPEN.len().min(bytes.len());
    for take in (1..=max).rev() {
        let start = bytes.len() - take;
        if PARTIAL_OPEN.as_bytes()[..take].eq_ignore_ascii_case(&bytes[start..]) {
            return start;
        }
    }
    buffer.len()
}

fn rfind_ascii_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let mut found = None;
    let mut at = from;
    while let Some(idx) = find_ascii_ci(haystack, needle, at) {
        found = Some(idx);
        at = idx + 1;
    }
    found
}
