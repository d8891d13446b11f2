use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Settlement status of a purchased verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// Debited, waiting for the provisioning outcome.
    Active,
    /// Provisioning succeeded; the debit is final.
    Delivered,
    /// Compensated by a refund.
    Refunded,
}

/// Why a verification is being refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Timeout,
    ProvisioningFailed,
    UserCancelled,
}

impl RefundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundReason::Timeout => "timeout",
            RefundReason::ProvisioningFailed => "provisioning_failed",
            RefundReason::UserCancelled => "user_cancelled",
        }
    }
}

/// A verification purchase and the debit that paid for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Verification {
    pub verification_id: String,
    pub user_id: Uuid,
    pub debit_transaction_id: Uuid,
    pub amount: Decimal,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    pub fn new(
        verification_id: impl Into<String>,
        user_id: Uuid,
        debit_transaction_id: Uuid,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            verification_id: verification_id.into(),
            user_id,
            debit_transaction_id,
            amount: amount.abs(),
            status: VerificationStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}
