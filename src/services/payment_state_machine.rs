use crate::error::{AppError, Result};
use crate::models::{PaymentAttempt, PaymentState, StateTransition};

/// Forward-only lifecycle of a payment attempt:
/// `pending → processing → completed | failed`.
#[derive(Debug, Clone)]
pub struct PaymentStateMachine;

impl PaymentStateMachine {
    /// Returns valid next states from the current state.
    pub fn valid_transitions(current: PaymentState) -> &'static [PaymentState] {
        match current {
            PaymentState::Pending => &[PaymentState::Processing],
            PaymentState::Processing => &[PaymentState::Completed, PaymentState::Failed],
            PaymentState::Completed | PaymentState::Failed => &[],
        }
    }

    /// Checks if a transition is valid.
    pub fn can_transition(from: PaymentState, to: PaymentState) -> bool {
        Self::valid_transitions(from).contains(&to)
    }

    /// Builds the log entry for moving `attempt` to `to`, caused by `cause`.
    pub fn transition(
        attempt: &PaymentAttempt,
        to: PaymentState,
        cause: &str,
    ) -> Result<StateTransition> {
        if Self::can_transition(attempt.state, to) {
            Ok(StateTransition::new(to, cause))
        } else {
            Err(AppError::Validation(format!(
                "Invalid payment transition from {} to {} for {}",
                attempt.state.as_str(),
                to.as_str(),
                attempt.external_reference
            )))
        }
    }
}
