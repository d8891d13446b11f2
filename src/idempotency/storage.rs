use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Namespace an idempotency key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyScope {
    /// Provider webhook `event_id`s.
    Webhook,
    /// Client-supplied `Idempotency-Key` headers.
    Api,
}

impl IdempotencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::Webhook => "webhook",
            IdempotencyScope::Api => "api",
        }
    }
}

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Reserved,
    Completed,
}

/// Stored idempotency record.
///
/// `owner` identifies the reservation; only the worker holding it may
/// complete or release the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub scope: IdempotencyScope,
    pub owner: Uuid,
    pub status: IdempotencyStatus,
    pub request_hash: String,
    pub result_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// A fresh reservation placeholder leased for `lease_seconds`.
    pub fn reservation(
        key: impl Into<String>,
        scope: IdempotencyScope,
        request_hash: impl Into<String>,
        lease_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            scope,
            owner: Uuid::new_v4(),
            status: IdempotencyStatus::Reserved,
            request_hash: request_hash.into(),
            result_snapshot: None,
            created_at: now,
            expires_at: now + Duration::seconds(lease_seconds),
            completed_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

/// Outcome of an atomic reservation attempt.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// The placeholder was written; the caller owns the key.
    Reserved(IdempotencyRecord),
    /// A live record already holds the key.
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts `record` unless a live record exists for `(key, scope)`.
    /// Expired records are replaced.
    async fn try_reserve(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome>;

    /// Stores the result and extends the record to `expires_at`. Returns
    /// `false` if `owner` no longer holds the reservation.
    async fn complete(
        &self,
        key: &str,
        scope: IdempotencyScope,
        owner: Uuid,
        result_snapshot: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drops an unfinished reservation so the operation can be retried.
    async fn release(&self, key: &str, scope: IdempotencyScope, owner: Uuid) -> Result<bool>;

    async fn find(&self, key: &str, scope: IdempotencyScope) -> Result<Option<IdempotencyRecord>>;

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

const RECORD_COLUMNS: &str =
    "key, scope, owner, status, request_hash, result_snapshot, created_at, expires_at, completed_at";

/// PostgreSQL-based idempotency storage. The unique index on `(key, scope)`
/// is what makes the reservation atomic across instances.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn try_reserve(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome> {
        let inserted = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            r#"
            INSERT INTO idempotency_records (key, scope, owner, status, request_hash, result_snapshot, created_at, expires_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (key, scope) DO UPDATE
            SET owner = EXCLUDED.owner,
                status = EXCLUDED.status,
                request_hash = EXCLUDED.request_hash,
                result_snapshot = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                completed_at = NULL
            WHERE idempotency_records.expires_at <= NOW()
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(&record.key)
        .bind(record.scope)
        .bind(record.owner)
        .bind(record.status)
        .bind(&record.request_hash)
        .bind(&record.result_snapshot)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if let Some(row) = inserted {
            return Ok(ReserveOutcome::Reserved(row));
        }

        // The live record may have been released between the two statements;
        // the guard retries that case like any other in-flight conflict.
        match self.find(&record.key, record.scope).await? {
            Some(existing) => Ok(ReserveOutcome::Existing(existing)),
            None => Err(AppError::ConflictInProgress(record.key.clone())),
        }
    }

    async fn complete(
        &self,
        key: &str,
        scope: IdempotencyScope,
        owner: Uuid,
        result_snapshot: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'completed', result_snapshot = $4, expires_at = $5, completed_at = NOW()
            WHERE key = $1 AND scope = $2 AND owner = $3
            "#,
        )
        .bind(key)
        .bind(scope)
        .bind(owner)
        .bind(result_snapshot)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, scope: IdempotencyScope, owner: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE key = $1 AND scope = $2 AND owner = $3 AND status = 'reserved'
            "#,
        )
        .bind(key)
        .bind(scope)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, key: &str, scope: IdempotencyScope) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1 AND scope = $2",
            RECORD_COLUMNS
        ))
        .bind(key)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

/// In-process store with the same semantics, for tests and single-node runs.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<(String, IdempotencyScope), IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_reserve(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome> {
        let mut records = self.records.lock().await;
        let slot = (record.key.clone(), record.scope);

        if let Some(existing) = records.get(&slot) {
            if !existing.is_expired_at(Utc::now()) {
                return Ok(ReserveOutcome::Existing(existing.clone()));
            }
        }

        records.insert(slot, record.clone());
        Ok(ReserveOutcome::Reserved(record.clone()))
    }

    async fn complete(
        &self,
        key: &str,
        scope: IdempotencyScope,
        owner: Uuid,
        result_snapshot: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&(key.to_string(), scope)) {
            Some(record) if record.owner == owner => {
                record.status = IdempotencyStatus::Completed;
                record.result_snapshot = Some(result_snapshot);
                record.expires_at = expires_at;
                record.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, scope: IdempotencyScope, owner: Uuid) -> Result<bool> {
        let mut records = self.records.lock().await;
        let slot = (key.to_string(), scope);
        let owned = matches!(
            records.get(&slot),
            Some(record) if record.owner == owner && record.status == IdempotencyStatus::Reserved
        );
        if owned {
            records.remove(&slot);
        }
        Ok(owned)
    }

    async fn find(&self, key: &str, scope: IdempotencyScope) -> Result<Option<IdempotencyRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&(key.to_string(), scope)).cloned())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}
