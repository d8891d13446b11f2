use rust_decimal::Decimal;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AppError>;

/// How the retry policy should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a delay (lock contention, storage blips).
    Transient,
    /// Retrying cannot help; dead-letter or surface immediately.
    Permanent,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Webhook signature is missing or invalid")]
    SignatureInvalid,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown payment reference: {0}")]
    UnknownReference(String),

    #[error("Idempotency key '{0}' was reused with a different payload")]
    IdempotencyConflict(String),

    #[error("Operation for key '{0}' is already in progress")]
    ConflictInProgress(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Decimal, available: Decimal },

    #[error("Timed out after {waited_ms}ms waiting for lock on '{resource}'")]
    LockTimeout { resource: String, waited_ms: u64 },

    #[error("Version conflict on account {user_id}: expected {expected}, found {actual}")]
    VersionConflict {
        user_id: uuid::Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Fencing token {token} is stale for account {user_id} (stored {current})")]
    StaleFencingToken {
        user_id: uuid::Uuid,
        token: i64,
        current: i64,
    },

    #[error("Coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Classifies the error for the shared retry policy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            AppError::ConflictInProgress(_)
            | AppError::LockTimeout { .. }
            | AppError::VersionConflict { .. }
            | AppError::StaleFencingToken { .. }
            | AppError::CoordinationUnavailable(_)
            | AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Kafka(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Short machine-readable code used in API responses and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::SignatureInvalid => "SIGNATURE_INVALID",
            AppError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            AppError::UnknownReference(_) => "UNKNOWN_REFERENCE",
            AppError::IdempotencyConflict(_) => "IDEMPOTENCY_CONFLICT",
            AppError::ConflictInProgress(_) => "CONFLICT_IN_PROGRESS",
            AppError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            AppError::LockTimeout { .. } => "LOCK_TIMEOUT",
            AppError::VersionConflict { .. } => "VERSION_CONFLICT",
            AppError::StaleFencingToken { .. } => "STALE_FENCING_TOKEN",
            AppError::CoordinationUnavailable(_) => "COORDINATION_UNAVAILABLE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Database(_) => "PERSISTENCE_ERROR",
            AppError::Redis(_) => "COORDINATION_UNAVAILABLE",
            AppError::Kafka(_) => "NOTIFICATION_ERROR",
            AppError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lock_and_conflict_errors_are_transient() {
        let timeout = AppError::LockTimeout {
            resource: "account:1".to_string(),
            waited_ms: 500,
        };
        assert_eq!(timeout.classify(), ErrorClass::Transient);
        assert!(AppError::ConflictInProgress("evt_1".to_string()).is_transient());
        assert!(AppError::CoordinationUnavailable("redis down".to_string()).is_transient());
    }

    #[test]
    fn test_validation_errors_are_permanent() {
        assert_eq!(AppError::SignatureInvalid.classify(), ErrorClass::Permanent);
        assert_eq!(
            AppError::MalformedPayload("missing event_id".to_string()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            AppError::UnknownReference("PAY-404".to_string()).classify(),
            ErrorClass::Permanent
        );
        let funds = AppError::InsufficientFunds {
            requested: dec!(5.00),
            available: dec!(1.00),
        };
        assert!(!funds.is_transient());
        assert_eq!(funds.code(), "INSUFFICIENT_FUNDS");
    }
}
