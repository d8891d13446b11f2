use crate::error::{AppError, Result};
use crate::idempotency::{IdempotencyGuard, IdempotencyKeyGenerator, IdempotencyScope, Replayable};
use crate::lock::{LockHandle, LockManager};
use crate::models::{topics, OutboxMessage, PaymentAttempt, PaymentState, Transaction};
use crate::observability::mask_amount;
use crate::repositories::{PaymentAttemptStore, PaymentCompletion};
use crate::services::ledger::{Adjustment, AdjustmentRequest, Ledger};
use crate::services::payment_state_machine::PaymentStateMachine;
use crate::webhook::payload::{WebhookEvent, WebhookStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// User-facing text for a failed payment.
pub const NO_CHARGE_MESSAGE: &str = "Payment failed. No charge applied.";

/// Logical payload of a payment-initialize call; its fingerprint decides
/// whether a reused `Idempotency-Key` is a replay or a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializePayment {
    pub user_id: Uuid,
    pub amount: Decimal,
}

/// Canonical form hashed for the idempotency fingerprint; `20.00` and `20`
/// are the same payment.
#[derive(Serialize)]
struct InitializeFingerprint {
    user_id: Uuid,
    amount: String,
}

impl From<&InitializePayment> for InitializeFingerprint {
    fn from(request: &InitializePayment) -> Self {
        Self {
            user_id: request.user_id,
            amount: request.amount.normalize().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitialized {
    pub payment_attempt_id: Uuid,
    pub external_reference: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub state: PaymentState,
}

impl From<&PaymentAttempt> for PaymentInitialized {
    fn from(attempt: &PaymentAttempt) -> Self {
        Self {
            payment_attempt_id: attempt.id,
            external_reference: attempt.external_reference.clone(),
            user_id: attempt.user_id,
            amount: attempt.amount,
            state: attempt.state,
        }
    }
}

/// Result of applying one provider event. Stored as the idempotency result
/// for the event id, so redeliveries return it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Credited {
        payment_attempt_id: Uuid,
        transaction_id: Uuid,
        amount: Decimal,
        new_balance: Decimal,
    },
    Failed {
        payment_attempt_id: Uuid,
        message: String,
    },
    /// The attempt was already terminal; nothing changed.
    AlreadyFinal {
        payment_attempt_id: Uuid,
        state: PaymentState,
    },
}

/// Payment initialization and the payment state machine driver.
pub struct PaymentService {
    attempts: Arc<dyn PaymentAttemptStore>,
    ledger: Arc<Ledger>,
    locks: Arc<LockManager>,
    guard: Arc<IdempotencyGuard>,
    keys: IdempotencyKeyGenerator,
}

impl PaymentService {
    pub fn new(
        attempts: Arc<dyn PaymentAttemptStore>,
        ledger: Arc<Ledger>,
        locks: Arc<LockManager>,
        guard: Arc<IdempotencyGuard>,
    ) -> Self {
        Self {
            attempts,
            ledger,
            locks,
            guard,
            keys: IdempotencyKeyGenerator::default(),
        }
    }

    /// Creates a pending payment attempt for a client `Idempotency-Key`.
    ///
    /// Within the key's TTL the same key and payload replays the original
    /// response; a different payload is `IdempotencyConflict`. Past the TTL
    /// the attempt's own unique key still returns the original attempt.
    pub async fn initialize_payment(
        &self,
        client_key: &str,
        request: InitializePayment,
    ) -> Result<Replayable<PaymentInitialized>> {
        if request.amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        let key = self.keys.from_client_key(client_key)?;
        let request_hash = self
            .keys
            .fingerprint(&InitializeFingerprint::from(&request))?;

        self.guard
            .execute(&key, IdempotencyScope::Api, &request_hash, || async {
                self.ledger.account(request.user_id).await?;

                let attempt = PaymentAttempt::new(request.user_id, key.clone(), request.amount);
                let stored = self.attempts.insert(&attempt).await?;
                if stored.user_id != request.user_id || stored.amount != request.amount {
                    return Err(AppError::IdempotencyConflict(client_key.to_string()));
                }

                tracing::info!(
                    payment_attempt_id = %stored.id,
                    reference = %stored.external_reference,
                    user_id = %stored.user_id,
                    amount = %mask_amount(&stored.amount),
                    "Payment attempt initialized"
                );
                Ok(PaymentInitialized::from(&stored))
            })
            .await
    }

    pub async fn attempt_by_reference(&self, reference: &str) -> Result<Option<PaymentAttempt>> {
        self.attempts.find_by_reference(reference).await
    }

    /// Drives the referenced attempt with `event`. Callers deduplicate by
    /// event id first; this method is itself safe to repeat.
    ///
    /// Unknown references and amount mismatches are permanent failures.
    /// Lock, version and storage failures are transient.
    pub async fn apply_event(&self, event: &WebhookEvent) -> Result<PaymentOutcome> {
        let attempt = self
            .attempts
            .find_by_reference(&event.reference)
            .await?
            .ok_or_else(|| AppError::UnknownReference(event.reference.clone()))?;

        if event.amount != attempt.amount {
            return Err(AppError::Validation(format!(
                "event {} amount {} does not match payment {} amount {}",
                event.event_id, event.amount, attempt.external_reference, attempt.amount
            )));
        }
        if attempt.state.is_terminal() {
            return Ok(already_final(&attempt));
        }

        let attempt_id = attempt.id;
        self.locks
            .with_account_lock(attempt.user_id, |handle| async move {
                self.apply_locked(&handle, attempt_id, event).await
            })
            .await
    }

    async fn apply_locked(
        &self,
        handle: &LockHandle,
        attempt_id: Uuid,
        event: &WebhookEvent,
    ) -> Result<PaymentOutcome> {
        let mut attempt = self.load(attempt_id).await?;

        if attempt.state == PaymentState::Pending {
            let entry = PaymentStateMachine::transition(&attempt, PaymentState::Processing, &event.event_id)?;
            attempt = match self.attempts.transition(attempt.id, PaymentState::Pending, entry).await? {
                Some(moved) => moved,
                // Lost a race with another worker; act on whatever it left.
                None => self.load(attempt_id).await?,
            };
        }

        if attempt.state.is_terminal() {
            return Ok(already_final(&attempt));
        }

        match event.status {
            WebhookStatus::Success => self.complete(handle, &attempt, event).await,
            WebhookStatus::Failed => self.fail(&attempt, event).await,
        }
    }

    async fn complete(
        &self,
        handle: &LockHandle,
        attempt: &PaymentAttempt,
        event: &WebhookEvent,
    ) -> Result<PaymentOutcome> {
        let account = self.ledger.account(attempt.user_id).await?;
        let transaction = Transaction::credit(attempt.user_id, attempt.id, attempt.amount);
        let completion = PaymentCompletion {
            attempt_id: attempt.id,
            transition: PaymentStateMachine::transition(attempt, PaymentState::Completed, &event.event_id)?,
        };
        let notification = OutboxMessage::new(
            attempt.user_id,
            topics::PAYMENT_CREDITED,
            json!({
                "payment_attempt_id": attempt.id,
                "reference": attempt.external_reference,
                "transaction_id": transaction.id,
                "amount": attempt.amount,
                "event_id": event.event_id,
            }),
        );

        let request = AdjustmentRequest::new(transaction, account.version)
            .completing(completion)
            .notify(notification);

        match self.ledger.adjust(handle, request).await? {
            Adjustment::Applied {
                new_balance,
                transaction,
                ..
            } => {
                tracing::info!(
                    payment_attempt_id = %attempt.id,
                    event_id = %event.event_id,
                    "Payment completed and credited"
                );
                Ok(PaymentOutcome::Credited {
                    payment_attempt_id: attempt.id,
                    transaction_id: transaction.id,
                    amount: transaction.amount,
                    new_balance,
                })
            }
            // The credit and the completion commit together, so the attempt
            // is already completed.
            Adjustment::Duplicate(_) => Ok(PaymentOutcome::AlreadyFinal {
                payment_attempt_id: attempt.id,
                state: PaymentState::Completed,
            }),
        }
    }

    async fn fail(&self, attempt: &PaymentAttempt, event: &WebhookEvent) -> Result<PaymentOutcome> {
        let entry = PaymentStateMachine::transition(attempt, PaymentState::Failed, &event.event_id)?;
        match self
            .attempts
            .transition(attempt.id, PaymentState::Processing, entry)
            .await?
        {
            Some(_) => {
                tracing::info!(
                    payment_attempt_id = %attempt.id,
                    event_id = %event.event_id,
                    "Payment failed, no balance change"
                );
                Ok(PaymentOutcome::Failed {
                    payment_attempt_id: attempt.id,
                    message: NO_CHARGE_MESSAGE.to_string(),
                })
            }
            None => Ok(already_final(&self.load(attempt.id).await?)),
        }
    }

    async fn load(&self, attempt_id: Uuid) -> Result<PaymentAttempt> {
        self.attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment attempt '{}' not found", attempt_id)))
    }
}

fn already_final(attempt: &PaymentAttempt) -> PaymentOutcome {
    PaymentOutcome::AlreadyFinal {
        payment_attempt_id: attempt.id,
        state: attempt.state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::{IdempotencyGuardConfig, InMemoryIdempotencyStore};
    use crate::lock::{InMemoryLockBackend, LockManagerConfig};
    use crate::repositories::InMemoryStore;
    use rust_decimal_macros::dec;

    struct Fixture {
        service: PaymentService,
        ledger: Arc<Ledger>,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(Ledger::new(store.clone()));
        let locks = Arc::new(LockManager::new(
            Arc::new(InMemoryLockBackend::new()),
            LockManagerConfig::default(),
        ));
        let guard = Arc::new(IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyGuardConfig::default(),
        ));
        let user_id = Uuid::new_v4();
        ledger.open_account(user_id).await.unwrap();

        Fixture {
            service: PaymentService::new(store, ledger.clone(), locks, guard),
            ledger,
            user_id,
        }
    }

    fn event(reference: &str, amount: Decimal, status: WebhookStatus) -> WebhookEvent {
        WebhookEvent {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            reference: reference.to_string(),
            amount,
            status,
        }
    }

    const KEY: &str = "7f1c2d3e-4b5a-4c6d-8e9f-0a1b2c3d4e5f";

    #[tokio::test]
    async fn test_initialize_replays_same_payload() {
        let f = fixture().await;
        let request = InitializePayment {
            user_id: f.user_id,
            amount: dec!(20.00),
        };

        let first = f.service.initialize_payment(KEY, request.clone()).await.unwrap();
        let second = f.service.initialize_payment(KEY, request).await.unwrap();

        assert!(!first.is_replay());
        assert!(second.is_replay());
        assert_eq!(first.into_inner(), second.into_inner());
    }

    #[tokio::test]
    async fn test_initialize_replays_amount_written_with_other_scale() {
        let f = fixture().await;
        let first = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20.00) })
            .await
            .unwrap();
        let second = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20) })
            .await
            .unwrap();

        assert!(second.is_replay());
        assert_eq!(first.into_inner(), second.into_inner());
    }

    #[tokio::test]
    async fn test_initialize_rejects_changed_payload() {
        let f = fixture().await;
        f.service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20.00) })
            .await
            .unwrap();

        let err = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(99.00) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_success_event_credits_and_completes() {
        let f = fixture().await;
        let init = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20.00) })
            .await
            .unwrap()
            .into_inner();

        let outcome = f
            .service
            .apply_event(&event(&init.external_reference, dec!(20.00), WebhookStatus::Success))
            .await
            .unwrap();
        assert!(matches!(outcome, PaymentOutcome::Credited { new_balance, .. } if new_balance == dec!(20.00)));

        let attempt = f
            .service
            .attempt_by_reference(&init.external_reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.state, PaymentState::Completed);
        let states: Vec<_> = attempt.state_transitions.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![PaymentState::Pending, PaymentState::Processing, PaymentState::Completed]
        );

        // A second, different event for the same attempt is a no-op.
        let again = f
            .service
            .apply_event(&event(&init.external_reference, dec!(20.00), WebhookStatus::Success))
            .await
            .unwrap();
        assert!(matches!(again, PaymentOutcome::AlreadyFinal { state: PaymentState::Completed, .. }));
        assert_eq!(f.ledger.balance(f.user_id).await.unwrap(), dec!(20.00));
    }

    #[tokio::test]
    async fn test_failed_event_changes_no_balance() {
        let f = fixture().await;
        let init = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20.00) })
            .await
            .unwrap()
            .into_inner();

        let outcome = f
            .service
            .apply_event(&event(&init.external_reference, dec!(20.00), WebhookStatus::Failed))
            .await
            .unwrap();

        match outcome {
            PaymentOutcome::Failed { message, .. } => assert_eq!(message, NO_CHARGE_MESSAGE),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(f.ledger.balance(f.user_id).await.unwrap(), dec!(0));
        assert!(f.ledger.transactions(f.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_reference_and_amount_mismatch_are_permanent() {
        let f = fixture().await;
        let err = f
            .service
            .apply_event(&event("PAY-missing", dec!(1.00), WebhookStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownReference(_)));
        assert!(!err.is_transient());

        let init = f
            .service
            .initialize_payment(KEY, InitializePayment { user_id: f.user_id, amount: dec!(20.00) })
            .await
            .unwrap()
            .into_inner();
        let err = f
            .service
            .apply_event(&event(&init.external_reference, dec!(2000.00), WebhookStatus::Success))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
