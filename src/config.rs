use std::{path::Path, time::Duration};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::Error;

/// Opening markers the tool-card parser claims for itself. Tags that would
/// match inside these markers must never reach the generic tag filter, which
/// would shred a card mid-stream.
const PARSER_OWNED_MARKERS: &[&str] = &["<xai:tool_usage_card", "<xai:tool_name>"];

/// Per-stream presentation and timeout settings.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StreamSettings {
    /// Emit `<think>` wrappers around chain-of-thought deltas. When false,
    /// thinking deltas are suppressed entirely.
    #[serde(default = "true_t")]
    pub show_thinking: bool,
    /// Emit tool-usage card lines. Only effective together with
    /// `show_thinking`.
    #[serde(default = "true_t")]
    pub show_search: bool,
    /// Comma-separated substrings; a token containing any of them is dropped
    /// for that frame.
    #[serde(default)]
    pub filtered_tags: String,
    /// Render generated videos as a poster-image anchor instead of a
    /// `<video>` tag.
    #[serde(default)]
    pub video_poster_preview: bool,
    /// Max wait until the first parsed frame. Zero disables the bound.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(default = "default_first_timeout")]
    pub first_timeout: Duration,
    /// Max idle time between frames after the first. Zero disables the bound.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout: Duration,
    /// Absolute wall-clock bound for the whole stream. Zero disables.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(default = "default_total_timeout")]
    pub total_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            show_thinking: true,
            show_search: true,
            filtered_tags: String::new(),
            video_poster_preview: false,
            first_timeout: default_first_timeout(),
            chunk_timeout: default_chunk_timeout(),
            total_timeout: default_total_timeout(),
        }
    }
}

impl StreamSettings {
    /// Parse `filtered_tags`, dropping empty entries and any tag the
    /// tool-card parser owns.
    pub fn filtered_tag_list(&self) -> Vec<String> {
        self.filtered_tags
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .filter(|tag| {
                let lower = tag.to_ascii_lowercase();
                !PARSER_OWNED_MARKERS
                    .iter()
                    .any(|marker| marker.contains(lower.as_str()) || lower.contains(marker))
            })
            .map(str::to_string)
            .collect()
    }
}

/// Crate-level configuration, loadable from TOML.
#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the upstream conversational API.
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    /// Base URL prepended to encoded asset paths. When unset, callers fall
    /// back to the request origin.
    pub asset_base_url: Option<String>,
    /// Default per-stream settings; callers may override per request.
    #[serde(default)]
    pub stream: StreamSettings,
    /// How long a conversation record stays resumable.
    #[serde_as(as = "DurationMilliSeconds")]
    #[serde(default = "default_conversation_ttl")]
    pub conversation_ttl: Duration,
    /// Rows kept per (scope, token) pair when trimming.
    #[serde(default = "default_keep_per_token")]
    pub keep_per_token: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: default_upstream_base_url(),
            asset_base_url: None,
            stream: StreamSettings::default(),
            conversation_ttl: default_conversation_ttl(),
            keep_per_token: default_keep_per_token(),
        }
    }
}

impl RelayConfig {
    /// Read a configuration file from this path.
    pub async fn from_path(path: &Path) -> Result<Self, Report<Error>> {
        let data = tokio::fs::read_to_string(path)
            .await
            .change_context(Error::ReadingConfig)?;
        let config: RelayConfig = toml::from_str(&data).change_context(Error::ReadingConfig)?;
        Ok(config)
    }

    /// The base URL for proxied asset paths, falling back to the request
    /// origin when the configuration does not set one.
    pub fn asset_base<'a>(&'a self, origin: &'a str) -> &'a str {
        self.asset_base_url.as_deref().unwrap_or(origin)
    }
}

fn true_t() -> bool {
    true
}

fn default_first_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_chunk_timeout() -> Duration {
    Duration::from_millis(60_000)
}

fn default_total_timeout() -> Duration {
    Duration::from_millis(600_000)
}

fn default_upstream_base_url() -> String {
    "https://grok.com/rest/app-chat".to_string()
}

fn default_conversation_ttl() -> Duration {
    Duration::from_secs(60 * 60 * 24)
}

fn default_keep_per_token() -> u32 {
    20
}
