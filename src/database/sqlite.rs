use error_stack::{Report, ResultExt};
use sqlx::SqlitePool;

use super::{
    clamp_cleanup_limit, token_suffix, ConversationRecord, ConversationStore, StoreStats,
    TokenCount,
};
use crate::Error;

const SQLITE_MIGRATIONS: &[&str] =
    &[include_str!("../../migrations/20250601_relay_conversations_sqlite.sql")];

#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    pub pool: SqlitePool,
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn upsert(&self, row: &ConversationRecord) -> Result<(), Report<Error>> {
        sqlx::query(
            "INSERT INTO conversations
              (scope, openai_conversation_id, grok_conversation_id, last_response_id,
               share_link_id, token, history_hash, created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (scope, openai_conversation_id) DO UPDATE SET
              grok_conversation_id = excluded.grok_conversation_id,
              last_response_id = excluded.last_response_id,
              share_link_id = excluded.share_link_id,
              token = excluded.token,
              history_hash = excluded.history_hash,
              updated_at = excluded.updated_at,
              expires_at = excluded.expires_at",
        )
        .bind(&row.scope)
        .bind(&row.openai_conversation_id)
        .bind(&row.grok_conversation_id)
        .bind(&row.last_response_id)
        .bind(&row.share_link_id)
        .bind(&row.token)
        .bind(&row.history_hash)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await
        .change_context(Error::WritingDatabase)?;

        Ok(())
    }

    async fn get_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
        now: i64,
    ) -> Result<Option<ConversationRecord>, Report<Error>> {
        sqlx::query(
            "DELETE FROM conversations
            WHERE scope = ? AND openai_conversation_id = ? AND expires_at <= ?",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .change_context(Error::WritingDatabase)?;

        let row: Option<ConversationRecord> = sqlx::query_as(
            "SELECT * FROM conversations
            WHERE scope = ? AND openai_conversation_id = ?",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .fetch_optional(&self.pool)
        .await
        .change_context(Error::LoadingDatabase)?;

        Ok(row)
    }

    async fn find_by_history_hash(
        &self,
        scope: &str,
        history_hash: &str,
        now: i64,
    ) -> Result<Option<ConversationRecord>, Report<Error>> {
        let purged = sqlx::query("DELETE FROM conversations WHERE scope = ? AND expires_at <= ?")
            .bind(scope)
            .bind(now)
            .execute(&self.pool)
            .await
            .change_context(Error::WritingDatabase)?;
        if purged.rows_affected() > 0 {
            tracing::debug!(scope, purged = purged.rows_affected(), "purged expired conversations");
        }

        let row: Option<ConversationRecord> = sqlx::query_as(
            "SELECT * FROM conversations
            WHERE scope = ? AND history_hash = ?
            ORDER BY updated_at DESC
            LIMIT 1",
        )
        .bind(scope)
        .bind(history_hash)
        .fetch_optional(&self.pool)
        .await
        .change_context(Error::LoadingDatabase)?;

        Ok(row)
    }

    async fn delete_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
    ) -> Result<(), Report<Error>> {
        sqlx::query("DELETE FROM conversations WHERE scope = ? AND openai_conversation_id = ?")
            .bind(scope)
            .bind(openai_conversation_id)
            .execute(&self.pool)
            .await
            .change_context(Error::WritingDatabase)?;

        Ok(())
    }

    async fn cleanup_expired(&self, limit: i64, now: i64) -> Result<u64, Report<Error>> {
        let result = sqlx::query(
            "DELETE FROM conversations
            WHERE rowid IN (
              SELECT rowid FROM conversations
              WHERE expires_at <= ?
              ORDER BY expires_at ASC
              LIMIT ?
            )",
        )
        .bind(now)
        .bind(clamp_cleanup_limit(limit))
        .execute(&self.pool)
        .await
        .change_context(Error::WritingDatabase)?;

        Ok(result.rows_affected())
    }

    async fn trim_for_token(
        &self,
        scope: &str,
        token: &str,
        keep: i64,
    ) -> Result<u64, Report<Error>> {
        let result = sqlx::query(
            "DELETE FROM conversations
            WHERE scope = ? AND token = ? AND openai_conversation_id NOT IN (
              SELECT openai_conversation_id FROM conversations
              WHERE scope = ? AND token = ?
              ORDER BY updated_at DESC
              LIMIT ?
            )",
        )
        .bind(scope)
        .bind(token)
        .bind(scope)
        .bind(token)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await
        .change_context(Error::WritingDatabase)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self, top_n: i64, now: i64) -> Result<StoreStats, Report<Error>> {
        let (active_total, expired_total): (i64, i64) = sqlx::query_as(
            "SELECT
              count(*) FILTER (WHERE expires_at > ?),
              count(*) FILTER (WHERE expires_at <= ?)
            FROM conversations",
        )
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .change_context(Error::LoadingDatabase)?;

        let tokens: Vec<(String, i64)> = sqlx::query_as(
            "SELECT token, count(*) as n FROM conversations
            WHERE expires_at > ?
            GROUP BY token
            ORDER BY n DESC
            LIMIT ?",
        )
        .bind(now)
        .bind(top_n.max(0))
        .fetch_all(&self.pool)
        .await
        .change_context(Error::LoadingDatabase)?;

        Ok(StoreStats {
            active_total,
            expired_total,
            top_tokens: tokens
                .into_iter()
                .map(|(token, count)| TokenCount {
                    token_suffix: token_suffix(&token),
                    count,
                })
                .collect(),
        })
    }
}

/// Create the conversations table if this database has not seen it yet.
/// Versions are tracked in a small metadata table so later migrations can be
/// appended to the list.
pub async fn run_default_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS relay_meta (
          key text PRIMARY KEY,
          value text
        );",
    )
    .execute(&mut *tx)
    .await?;

    let migration_version = sqlx::query_scalar::<_, i32>(
        "SELECT cast(value as int) FROM relay_meta WHERE key='migration_version'",
    )
    .fetch_optional(&mut *tx)
    .await?
    .unwrap_or(0) as usize;

    tracing::info!("Migration version is {}", migration_version);

    let start_migration = migration_version.min(SQLITE_MIGRATIONS.len());
    for (i, migration) in SQLITE_MIGRATIONS[start_migration..].iter().enumerate() {
        tracing::info!("Running migration {}", start_migration + i);
        sqlx::raw_sql(migration).execute(&mut *tx).await?;
    }

    let new_version = SQLITE_MIGRATIONS.len();

    sqlx::query(
        "INSERT INTO relay_meta (key, value) VALUES ('migration_version', $1)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(new_version.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_754_000_000_000;
    const HOUR: i64 = 3_600_000;

    async fn test_store() -> SqliteConversationStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_default_migrations(&pool).await.unwrap();
        SqliteConversationStore::new(pool)
    }

    fn record(scope: &str, id: &str, updated_at: i64, expires_at: i64) -> ConversationRecord {
        ConversationRecord {
            scope: scope.to_string(),
            openai_conversation_id: id.to_string(),
            grok_conversation_id: format!("grok-{id}"),
            last_response_id: "resp-1".to_string(),
            share_link_id: String::new(),
            token: "sso=abcdef".to_string(),
            history_hash: "hash-1".to_string(),
            created_at: updated_at - HOUR,
            updated_at,
            expires_at,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let store = test_store().await;
        let row = record("k:1", "conv-1", NOW, NOW + HOUR);
        store.upsert(&row).await.unwrap();

        let loaded = store.get_by_id("k:1", "conv-1", NOW).await.unwrap().unwrap();
        assert_eq!(loaded, row);

        // Replacing updates mutable fields but keeps created_at.
        let mut updated = row.clone();
        updated.last_response_id = "resp-2".to_string();
        updated.created_at = 0;
        updated.updated_at = NOW + 1;
        store.upsert(&updated).await.unwrap();

        let loaded = store.get_by_id("k:1", "conv-1", NOW).await.unwrap().unwrap();
        assert_eq!(loaded.last_response_id, "resp-2");
        assert_eq!(loaded.created_at, row.created_at);
    }

    #[tokio::test]
    async fn expired_rows_are_never_returned() {
        let store = test_store().await;
        store
            .upsert(&record("k:1", "conv-1", NOW, NOW + HOUR))
            .await
            .unwrap();

        assert!(store
            .get_by_id("k:1", "conv-1", NOW + 2 * HOUR)
            .await
            .unwrap()
            .is_none());

        // The purge-on-read deleted the row for good.
        assert!(store.get_by_id("k:1", "conv-1", NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_hash_returns_newest_live_match() {
        let store = test_store().await;
        let mut old = record("k:1", "conv-old", NOW - HOUR, NOW + HOUR);
        old.history_hash = "h".to_string();
        let mut new = record("k:1", "conv-new", NOW, NOW + HOUR);
        new.history_hash = "h".to_string();
        let mut expired = record("k:1", "conv-exp", NOW + HOUR, NOW - 1);
        expired.history_hash = "h".to_string();

        store.upsert(&old).await.unwrap();
        store.upsert(&new).await.unwrap();
        store.upsert(&expired).await.unwrap();

        let found = store
            .find_by_history_hash("k:1", "h", NOW)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.openai_conversation_id, "conv-new");

        // Other scopes see nothing.
        assert!(store
            .find_by_history_hash("k:2", "h", NOW)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cleanup_deletes_oldest_first_up_to_limit() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .upsert(&record("k:1", &format!("conv-{i}"), NOW, NOW - 100 + i))
                .await
                .unwrap();
        }

        assert_eq!(store.cleanup_expired(2, NOW).await.unwrap(), 2);
        assert_eq!(store.cleanup_expired(0, NOW).await.unwrap(), 1);
        assert_eq!(store.cleanup_expired(500, NOW).await.unwrap(), 2);
        assert_eq!(store.cleanup_expired(500, NOW).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_keeps_most_recent_rows() {
        let store = test_store().await;
        for i in 0..6i64 {
            store
                .upsert(&record("k:1", &format!("conv-{i}"), NOW + i, NOW + HOUR))
                .await
                .unwrap();
        }

        let removed = store.trim_for_token("k:1", "sso=abcdef", 2).await.unwrap();
        assert_eq!(removed, 4);

        for i in 0..6i64 {
            let row = store
                .get_by_id("k:1", &format!("conv-{i}"), NOW)
                .await
                .unwrap();
            assert_eq!(row.is_some(), i >= 4, "conv-{i}");
        }
    }

    #[tokio::test]
    async fn stats_group_live_rows_by_token() {
        let store = test_store().await;
        let mut a = record("k:1", "conv-a", NOW, NOW + HOUR);
        a.token = "sso=aaa111".to_string();
        let mut b = record("k:1", "conv-b", NOW, NOW + HOUR);
        b.token = "sso=aaa111".to_string();
        let mut c = record("k:2", "conv-c", NOW, NOW + HOUR);
        c.token = "sso=bbb222".to_string();
        let mut dead = record("k:2", "conv-d", NOW, NOW - 1);
        dead.token = "sso=bbb222".to_string();

        for row in [&a, &b, &c, &dead] {
            store.upsert(row).await.unwrap();
        }

        let stats = store.stats(10, NOW).await.unwrap();
        assert_eq!(stats.active_total, 3);
        assert_eq!(stats.expired_total, 1);
        assert_eq!(
            stats.top_tokens,
            vec![
                TokenCount {
                    token_suffix: "aaa111".to_string(),
                    count: 2
                },
                TokenCount {
                    token_suffix: "bbb222".to_string(),
                    count: 1
                },
            ]
        );
    }
}
