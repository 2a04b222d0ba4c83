//! Persistent conversation records.
//!
//! One row per (scope, client-visible conversation id). Rows carry the
//! upstream conversation id and continuation cursor, the credential
//! fingerprint used for trimming, and the history hash used to re-enter a
//! conversation from a fresh request. Readers purge expired rows before
//! returning anything, and every read takes an explicit `now` so tests stay
//! deterministic.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Upper bound on a single `cleanup_expired` batch.
const MAX_CLEANUP_BATCH: i64 = 500;

/// How many trailing characters of a token fingerprint show up in stats.
const TOKEN_SUFFIX_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationRecord {
    pub scope: String,
    pub openai_conversation_id: String,
    pub grok_conversation_id: String,
    pub last_response_id: String,
    pub share_link_id: String,
    pub token: String,
    pub history_hash: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    /// Trailing characters of the token fingerprint, enough to tell keys
    /// apart without logging them.
    pub token_suffix: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active_total: i64,
    pub expired_total: i64,
    pub top_tokens: Vec<TokenCount>,
}

/// Conversation persistence operations. All writes go through these; reads
/// never return a row whose `expires_at` has passed.
#[async_trait::async_trait]
pub trait ConversationStore: std::fmt::Debug + Send + Sync {
    /// Insert or replace by primary key, updating all mutable fields
    /// atomically. `created_at` is preserved on replace.
    async fn upsert(&self, row: &ConversationRecord) -> Result<(), Report<Error>>;

    /// Fetch one row, purging it first if it has expired.
    async fn get_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
        now: i64,
    ) -> Result<Option<ConversationRecord>, Report<Error>>;

    /// Purge expired rows in the scope, then return the newest live match.
    async fn find_by_history_hash(
        &self,
        scope: &str,
        history_hash: &str,
        now: i64,
    ) -> Result<Option<ConversationRecord>, Report<Error>>;

    async fn delete_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
    ) -> Result<(), Report<Error>>;

    /// Delete up to `limit` (clamped to 1..=500) expired rows, oldest first.
    /// Returns how many were removed.
    async fn cleanup_expired(&self, limit: i64, now: i64) -> Result<u64, Report<Error>>;

    /// Keep the `keep` most recently updated rows for (scope, token), delete
    /// the rest. Returns how many were removed.
    async fn trim_for_token(
        &self,
        scope: &str,
        token: &str,
        keep: i64,
    ) -> Result<u64, Report<Error>>;

    /// Live/expired row counts plus the busiest token fingerprints.
    async fn stats(&self, top_n: i64, now: i64) -> Result<StoreStats, Report<Error>>;
}

fn clamp_cleanup_limit(limit: i64) -> i64 {
    limit.clamp(1, MAX_CLEANUP_BATCH)
}

fn token_suffix(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let start = chars.len().saturating_sub(TOKEN_SUFFIX_LEN);
    chars[start..].iter().collect()
}
