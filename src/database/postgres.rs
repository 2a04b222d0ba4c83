use error_stack::{Report, ResultExt};
use sqlx::PgPool;

use super::{
    clamp_cleanup_limit, token_suffix, ConversationRecord, ConversationStore, StoreStats,
    TokenCount,
};
use crate::Error;

const POSTGRES_MIGRATIONS: &[&str] =
    &[include_str!("../../migrations/20250601_relay_conversations_postgres.sql")];

#[derive(Debug, Clone)]
pub struct PostgresConversationStore {
    pub pool: PgPool,
}

impl PostgresConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationStore for PostgresConversationStore {
    async fn upsert(&self, row: &ConversationRecord) -> Result<(), Report<Error>> {
        sqlx::query(
            "INSERT INTO conversations
              (scope, openai_conversation_id, grok_conversation_id, last_response_id,
               share_link_id, token, history_hash, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            WHERE scope = $1 AND openai_conversation_id = $2 AND expires_at <= $3",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .change_context(Error::WritingDatabase)?;

        let row: Option<ConversationRecord> = sqlx::query_as(
            "SELECT * FROM conversations
            WHERE scope = $1 AND openai_conversation_id = $2",
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
        let purged = sqlx::query("DELETE FROM conversations WHERE scope = $1 AND expires_at <= $2")
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
            WHERE scope = $1 AND history_hash = $2
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
        sqlx::query("DELETE FROM conversations WHERE scope = $1 AND openai_conversation_id = $2")
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
            WHERE ctid IN (
              SELECT ctid FROM conversations
              WHERE expires_at <= $1
              ORDER BY expires_at ASC
              LIMIT $2
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
            WHERE scope = $1 AND token = $2 AND openai_conversation_id NOT IN (
              SELECT openai_conversation_id FROM conversations
              WHERE scope = $1 AND token = $2
              ORDER BY updated_at DESC
              LIMIT $3
            )",
        )
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
              count(*) FILTER (WHERE expires_at > $1),
              count(*) FILTER (WHERE expires_at <= $1)
            FROM conversations",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .change_context(Error::LoadingDatabase)?;

        let tokens: Vec<(String, i64)> = sqlx::query_as(
            "SELECT token, count(*) as n FROM conversations
            WHERE expires_at > $1
            GROUP BY token
            ORDER BY n DESC
            LIMIT $2",
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
pub async fn run_default_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
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

    let start_migration = migration_version.min(POSTGRES_MIGRATIONS.len());
    for (i, migration) in POSTGRES_MIGRATIONS[start_migration..].iter().enumerate() {
        tracing::info!("Running migration {}", start_migration + i);
        sqlx::raw_sql(migration).execute(&mut *tx).await?;
    }

    let new_version = POSTGRES_MIGRATIONS.len();

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
