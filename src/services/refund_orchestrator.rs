use crate::error::{AppError, Result};
use crate::lock::{LockHandle, LockManager};
use crate::models::{topics, OutboxMessage, RefundReason, Transaction, TransactionType, VerificationStatus};
use crate::observability::{get_metrics, mask_amount};
use crate::repositories::VerificationChange;
use crate::retry::RetryPolicy;
use crate::services::ledger::{Adjustment, AdjustmentRequest, Ledger};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded {
        refund_transaction_id: Uuid,
        amount: Decimal,
        new_balance: Decimal,
    },
    /// A refund for this verification already exists; nothing changed.
    AlreadyRefunded { refund_transaction_id: Uuid },
    /// The verification was delivered first, so its debit is final.
    AlreadyDelivered,
}

impl RefundOutcome {
    fn label(&self) -> &'static str {
        match self {
            RefundOutcome::Refunded { .. } => "refunded",
            RefundOutcome::AlreadyRefunded { .. } => "already_refunded",
            RefundOutcome::AlreadyDelivered => "already_delivered",
        }
    }
}

/// Compensates the debit of a failed, timed-out or cancelled verification.
///
/// Safe under concurrent invocation for the same verification: the per-user
/// lock orders the callers, the unique `(verification_id, refund)` constraint
/// backs it up, and every loser observes the surviving refund and returns
/// `AlreadyRefunded`.
pub struct RefundOrchestrator {
    ledger: Arc<Ledger>,
    locks: Arc<LockManager>,
    retry: RetryPolicy,
}

impl RefundOrchestrator {
    pub fn new(ledger: Arc<Ledger>, locks: Arc<LockManager>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            locks,
            retry,
        }
    }

    /// Refunds `verification_id`, retrying transient failures with the
    /// shared policy. Only reports `Refunded` after the refund committed.
    pub async fn refund(&self, verification_id: &str, reason: RefundReason) -> Result<RefundOutcome> {
        let result = self
            .retry
            .run("refund", |_| self.refund_once(verification_id, reason))
            .await;

        match &result {
            Ok(outcome) => get_metrics().record_refund(outcome.label()),
            Err(e) => {
                get_metrics().record_refund("failed");
                tracing::error!(
                    verification_id = %verification_id,
                    reason = reason.as_str(),
                    error = %e,
                    "Refund failed"
                );
            }
        }
        result
    }

    async fn refund_once(&self, verification_id: &str, reason: RefundReason) -> Result<RefundOutcome> {
        let debit = self
            .ledger
            .verification_transaction(verification_id, TransactionType::Debit)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No debit found for verification '{}'", verification_id))
            })?;

        // Cheap pre-check; repeated below under the lock.
        if let Some(existing) = self.existing_refund(verification_id).await? {
            return Ok(RefundOutcome::AlreadyRefunded {
                refund_transaction_id: existing.id,
            });
        }

        self.locks
            .with_account_lock(debit.account_user_id, |handle| async move {
                self.refund_locked(&handle, &debit, reason).await
            })
            .await
    }

    async fn refund_locked(
        &self,
        handle: &LockHandle,
        debit: &Transaction,
        reason: RefundReason,
    ) -> Result<RefundOutcome> {
        let verification_id = debit.verification_id.clone().unwrap_or_default();

        if let Some(existing) = self.existing_refund(&verification_id).await? {
            return Ok(RefundOutcome::AlreadyRefunded {
                refund_transaction_id: existing.id,
            });
        }
        if let Some(verification) = self.ledger.verification(&verification_id).await? {
            if verification.status == VerificationStatus::Delivered {
                tracing::info!(
                    verification_id = %verification_id,
                    reason = reason.as_str(),
                    "Refund skipped, verification already delivered"
                );
                return Ok(RefundOutcome::AlreadyDelivered);
            }
        }

        let account = self.ledger.account(debit.account_user_id).await?;
        let refund = Transaction::refund_of(debit);
        let notification = OutboxMessage::new(
            debit.account_user_id,
            topics::VERIFICATION_REFUNDED,
            json!({
                "verification_id": verification_id,
                "transaction_id": refund.id,
                "debit_transaction_id": debit.id,
                "amount": refund.amount,
                "reason": reason.as_str(),
            }),
        );
        let request = AdjustmentRequest::new(refund, account.version)
            .with_verification(VerificationChange::MarkRefunded {
                verification_id: verification_id.clone(),
            })
            .notify(notification);

        match self.ledger.adjust(handle, request).await? {
            Adjustment::Applied {
                new_balance,
                transaction,
                ..
            } => {
                tracing::info!(
                    verification_id = %verification_id,
                    transaction_id = %transaction.id,
                    reason = reason.as_str(),
                    amount = %mask_amount(&transaction.amount),
                    "Verification refunded"
                );
                Ok(RefundOutcome::Refunded {
                    refund_transaction_id: transaction.id,
                    amount: transaction.amount,
                    new_balance,
                })
            }
            Adjustment::Duplicate(existing) => Ok(RefundOutcome::AlreadyRefunded {
                refund_transaction_id: existing.id,
            }),
        }
    }

    async fn existing_refund(&self, verification_id: &str) -> Result<Option<Transaction>> {
        self.ledger
            .verification_transaction(verification_id, TransactionType::Refund)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLockBackend, LockManagerConfig};
    use crate::repositories::InMemoryStore;
    use crate::services::verification_service::{PurchaseRequest, VerificationService};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        refunds: RefundOrchestrator,
        verifications: VerificationService,
        ledger: Arc<Ledger>,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(Ledger::new(store));
        let locks = Arc::new(LockManager::new(
            Arc::new(InMemoryLockBackend::new()),
            LockManagerConfig::default(),
        ));
        let user_id = Uuid::new_v4();
        ledger.open_account(user_id).await.unwrap();

        let handle = locks.acquire_account(user_id).await.unwrap();
        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(10.00));
        ledger.adjust(&handle, AdjustmentRequest::new(credit, 0)).await.unwrap();
        locks.release(&handle).await.unwrap();

        let verifications = VerificationService::new(ledger.clone(), locks.clone());
        verifications
            .purchase(PurchaseRequest {
                verification_id: "ver_1".to_string(),
                user_id,
                amount: dec!(5.00),
            })
            .await
            .unwrap();

        Fixture {
            refunds: RefundOrchestrator::new(
                ledger.clone(),
                locks,
                RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            ),
            verifications,
            ledger,
            user_id,
        }
    }

    #[tokio::test]
    async fn test_refund_restores_balance_once() {
        let f = fixture().await;

        let first = f.refunds.refund("ver_1", RefundReason::Timeout).await.unwrap();
        assert!(matches!(first, RefundOutcome::Refunded { new_balance, .. } if new_balance == dec!(10.00)));

        let second = f.refunds.refund("ver_1", RefundReason::Timeout).await.unwrap();
        assert!(matches!(second, RefundOutcome::AlreadyRefunded { .. }));
        assert_eq!(f.ledger.balance(f.user_id).await.unwrap(), dec!(10.00));
        assert_eq!(
            f.ledger.verification("ver_1").await.unwrap().unwrap().status,
            VerificationStatus::Refunded
        );
    }

    #[tokio::test]
    async fn test_refund_after_delivery_is_noop() {
        let f = fixture().await;
        f.verifications.confirm_delivery("ver_1").await.unwrap();

        let outcome = f
            .refunds
            .refund("ver_1", RefundReason::UserCancelled)
            .await
            .unwrap();
        assert_eq!(outcome, RefundOutcome::AlreadyDelivered);
        assert_eq!(f.ledger.balance(f.user_id).await.unwrap(), dec!(5.00));
    }

    #[tokio::test]
    async fn test_unknown_verification_is_not_found() {
        let f = fixture().await;
        let err = f
            .refunds
            .refund("ver_missing", RefundReason::ProvisioningFailed)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
