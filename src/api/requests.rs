use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::RefundReason;

/// Header carrying the client's idempotency key on payment initialization.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Request to start a payment that will credit the user's balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializePaymentRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
}

impl InitializePaymentRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.amount <= Decimal::ZERO {
            errors.push(ValidationError { field: "amount".to_string(), message: "amount must be positive".to_string() });
        }
        if self.amount.scale() > 2 {
            errors.push(ValidationError { field: "amount".to_string(), message: "amount cannot have more than 2 decimal places".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Request to buy a verification, debiting its price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseVerificationRequest {
    pub verification_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
}

impl PurchaseVerificationRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.verification_id.trim().is_empty() {
            errors.push(ValidationError { field: "verification_id".to_string(), message: "verification_id cannot be empty".to_string() });
        }
        if self.amount <= Decimal::ZERO {
            errors.push(ValidationError { field: "amount".to_string(), message: "amount must be positive".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Signal that a verification failed, timed out or was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundVerificationRequest {
    pub reason: RefundReason,
}

/// Query parameters for listing dead-lettered webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDeadLettersQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_initialize_payment_validation() {
        let valid = InitializePaymentRequest { user_id: Uuid::new_v4(), amount: dec!(20.00) };
        assert!(valid.validate().is_ok());

        let negative = InitializePaymentRequest { user_id: Uuid::new_v4(), amount: dec!(-1) };
        assert!(negative.validate().is_err());

        let fractional = InitializePaymentRequest { user_id: Uuid::new_v4(), amount: dec!(1.005) };
        let errors = fractional.validate().unwrap_err();
        assert_eq!(errors[0].field, "amount");
    }

    #[test]
    fn test_purchase_validation_reports_every_field() {
        let request = PurchaseVerificationRequest {
            verification_id: " ".to_string(),
            user_id: Uuid::new_v4(),
            amount: dec!(0),
        };
        assert_eq!(request.validate().unwrap_err().len(), 2);
    }
}
