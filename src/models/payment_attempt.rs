use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an inbound payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PaymentState {
    /// Completed and failed attempts never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Processing => "processing",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
        }
    }
}

/// One entry of the ordered transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: PaymentState,
    pub at: DateTime<Utc>,
    /// Provider event id (or internal cause) that triggered the move.
    pub cause: String,
}

impl StateTransition {
    pub fn new(state: PaymentState, cause: impl Into<String>) -> Self {
        Self {
            state,
            at: Utc::now(),
            cause: cause.into(),
        }
    }
}

/// A single inbound payment that will credit a user's balance once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Reference shared with the payment provider. Globally unique.
    pub external_reference: String,
    /// Client-supplied initialization key. Globally unique.
    pub idempotency_key: String,
    pub amount: Decimal,
    pub state: PaymentState,
    pub state_transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    pub fn new(user_id: Uuid, idempotency_key: impl Into<String>, amount: Decimal) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            user_id,
            external_reference: format!("PAY-{}", id.simple()),
            idempotency_key: idempotency_key.into(),
            amount,
            state: PaymentState::Pending,
            state_transitions: vec![StateTransition::new(PaymentState::Pending, "initialized")],
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a transition record and moves to its state.
    /// Callers are expected to have validated the move with `PaymentStateMachine`.
    pub fn record(&mut self, transition: StateTransition) {
        self.state = transition.state;
        self.updated_at = transition.at;
        self.state_transitions.push(transition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_attempt_starts_pending() {
        let attempt = PaymentAttempt::new(Uuid::new_v4(), "key-1", dec!(20.00));

        assert_eq!(attempt.state, PaymentState::Pending);
        assert_eq!(attempt.state_transitions.len(), 1);
        assert!(attempt.external_reference.starts_with("PAY-"));
    }

    #[test]
    fn test_record_appends_transition() {
        let mut attempt = PaymentAttempt::new(Uuid::new_v4(), "key-1", dec!(20.00));
        attempt.record(StateTransition::new(PaymentState::Processing, "evt_1"));

        assert_eq!(attempt.state, PaymentState::Processing);
        assert_eq!(attempt.state_transitions.last().unwrap().cause, "evt_1");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PaymentState::Pending.is_terminal());
        assert!(!PaymentState::Processing.is_terminal());
        assert!(PaymentState::Completed.is_terminal());
        assert!(PaymentState::Failed.is_terminal());
    }
}
