use crate::error::{AppError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Provider-reported outcome of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    #[serde(alias = "successful", alias = "completed", alias = "paid")]
    Success,
    #[serde(alias = "failure", alias = "declined")]
    Failed,
}

/// Inbound payment event body: `{event_id, reference, amount, status}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    /// Our `external_reference` for the payment attempt.
    pub reference: String,
    pub amount: Decimal,
    pub status: WebhookStatus,
}

impl WebhookEvent {
    /// Parses and validates the raw body. Only call after the signature has
    /// been verified.
    pub fn parse(raw_body: &[u8]) -> Result<Self> {
        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|e| AppError::MalformedPayload(e.to_string()))?;

        if event.event_id.trim().is_empty() {
            return Err(AppError::MalformedPayload("event_id is empty".to_string()));
        }
        if event.reference.trim().is_empty() {
            return Err(AppError::MalformedPayload("reference is empty".to_string()));
        }
        if event.amount <= Decimal::ZERO {
            return Err(AppError::MalformedPayload(format!(
                "amount must be positive, got {}",
                event.amount
            )));
        }

        Ok(event)
    }
}
