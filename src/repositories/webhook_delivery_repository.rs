use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::WebhookDeliveryLog;
use crate::repositories::ports::WebhookDeliveryStore;

const DELIVERY_COLUMNS: &str = "id, event_id, payload_hash, payload, signature_valid, processed, status, attempt_count, next_retry_at, last_error, created_at, updated_at";

/// Repository for the webhook delivery log and its dead-letter queue.
pub struct PostgresWebhookDeliveryStore {
    pool: PgPool,
}

impl PostgresWebhookDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookDeliveryStore for PostgresWebhookDeliveryStore {
    async fn insert(&self, log: &WebhookDeliveryLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, event_id, payload_hash, payload, signature_valid, processed, status, attempt_count, next_retry_at, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(log.id)
        .bind(&log.event_id)
        .bind(&log.payload_hash)
        .bind(&log.payload)
        .bind(log.signature_valid)
        .bind(log.processed)
        .bind(log.status)
        .bind(log.attempt_count)
        .bind(log.next_retry_at)
        .bind(&log.last_error)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>> {
        let row = sqlx::query_as::<_, WebhookDeliveryLog>(&format!(
            "SELECT {} FROM webhook_deliveries WHERE id = $1",
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryLog>> {
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid lease: {}", e)))?;

        let rows = sqlx::query_as::<_, WebhookDeliveryLog>(&format!(
            r#"
            UPDATE webhook_deliveries
            SET next_retry_at = $2, updated_at = $1
            WHERE id IN (
                SELECT id FROM webhook_deliveries
                WHERE status = 'pending' AND next_retry_at <= $1
                ORDER BY next_retry_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempt_count = $2, next_retry_at = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_retry_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_processed(&self, id: Uuid, attempt_count: i32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'processed', processed = TRUE, attempt_count = $2,
                next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_dead_lettered(&self, id: Uuid, attempt_count: i32, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'dead_lettered', attempt_count = $2, last_error = $3,
                next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>> {
        let row = sqlx::query_as::<_, WebhookDeliveryLog>(&format!(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending', attempt_count = 0, next_retry_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'dead_lettered' AND signature_valid
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<WebhookDeliveryLog>> {
        let rows = sqlx::query_as::<_, WebhookDeliveryLog>(&format!(
            "SELECT {} FROM webhook_deliveries WHERE status = 'dead_lettered' ORDER BY created_at LIMIT $1",
            DELIVERY_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
