use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Account, DeliveryStatus, Transaction, TransactionType, WebhookDeliveryLog};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

/// Acknowledgement of a webhook delivery. Not a promise of completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAckResponse {
    pub delivery_id: Uuid,
    pub event_id: String,
    pub status: String,
}

/// Balance response DTO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for BalanceResponse {
    fn from(account: Account) -> Self {
        Self {
            user_id: account.user_id,
            balance: account.balance,
            version: account.version,
            updated_at: account.updated_at,
        }
    }
}

/// Transaction response DTO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub payment_attempt_id: Option<Uuid>,
    pub verification_id: Option<String>,
    pub reverses_transaction_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            id: tx.id,
            transaction_type: tx.transaction_type,
            amount: tx.amount,
            payment_attempt_id: tx.payment_attempt_id,
            verification_id: tx.verification_id,
            reverses_transaction_id: tx.reverses_transaction_id,
            created_at: tx.created_at,
        }
    }
}

/// Dead-letter entry DTO. The raw payload is omitted; only its hash is shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub id: Uuid,
    pub event_id: Option<String>,
    pub payload_hash: String,
    pub signature_valid: bool,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookDeliveryLog> for DeliveryResponse {
    fn from(log: WebhookDeliveryLog) -> Self {
        Self {
            id: log.id,
            event_id: log.event_id,
            payload_hash: log.payload_hash,
            signature_valid: log.signature_valid,
            status: log.status,
            attempt_count: log.attempt_count,
            last_error: log.last_error,
            created_at: log.created_at,
        }
    }
}
