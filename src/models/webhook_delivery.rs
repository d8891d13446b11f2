use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Processing status of a received webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted, waiting for (another) processing attempt.
    Pending,
    /// Applied to the ledger (or found to be a replay).
    Processed,
    /// Gave up; held for manual reconciliation.
    DeadLettered,
}

/// Durable record of one inbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct WebhookDeliveryLog {
    pub id: Uuid,
    pub event_id: Option<String>,
    pub payload_hash: String,
    /// Raw body as received, kept for asynchronous processing and replay.
    pub payload: String,
    pub signature_valid: bool,
    pub processed: bool,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDeliveryLog {
    /// A delivery with a valid signature, queued for immediate processing.
    pub fn accepted(event_id: impl Into<String>, raw_body: &[u8]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_id: Some(event_id.into()),
            payload_hash: payload_hash(raw_body),
            payload: String::from_utf8_lossy(raw_body).into_owned(),
            signature_valid: true,
            processed: false,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_retry_at: Some(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A delivery rejected before any business logic ran.
    pub fn rejected(raw_body: &[u8], signature_valid: bool, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_id: None,
            payload_hash: payload_hash(raw_body),
            payload: String::from_utf8_lossy(raw_body).into_owned(),
            signature_valid,
            processed: false,
            status: DeliveryStatus::DeadLettered,
            attempt_count: 0,
            next_retry_at: None,
            last_error: Some(reason.into()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Hex SHA-256 of the raw payload.
pub fn payload_hash(raw_body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_body);
    hex::encode(hasher.finalize())
}
