use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::OutboxMessage;
use crate::repositories::ports::OutboxStore;

const OUTBOX_COLUMNS: &str = "id, user_id, topic, payload, status, attempts, next_attempt_at, last_error, created_at, delivered_at";

/// Repository for outbox messages. Inserts happen inside the ledger commit;
/// this store only serves the delivery worker.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>> {
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid lease: {}", e)))?;

        let rows = sqlx::query_as::<_, OutboxMessage>(&format!(
            r#"
            UPDATE outbox_messages
            SET next_attempt_at = $2
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'delivered', attempts = attempts + 1, delivered_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempts = $2, next_attempt_at = $3, last_error = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'failed', attempts = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query_as::<_, OutboxMessage>(&format!(
            "SELECT {} FROM outbox_messages WHERE user_id = $1 ORDER BY created_at",
            OUTBOX_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
