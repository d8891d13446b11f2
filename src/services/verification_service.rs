use crate::error::{AppError, Result};
use crate::lock::{LockHandle, LockManager};
use crate::models::{topics, OutboxMessage, Transaction, TransactionType, Verification, VerificationStatus};
use crate::observability::mask_amount;
use crate::repositories::VerificationChange;
use crate::services::ledger::{Adjustment, AdjustmentRequest, Ledger};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub verification_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub verification_id: String,
    pub debit_transaction_id: Uuid,
    pub amount: Decimal,
    pub balance: Decimal,
    /// True when the verification was already purchased and nothing changed.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    AlreadyDelivered,
    /// A refund won the race; the debit has already been compensated.
    AlreadyRefunded,
}

/// Verification purchases (debits) and the provisioning success signal.
pub struct VerificationService {
    ledger: Arc<Ledger>,
    locks: Arc<LockManager>,
}

impl VerificationService {
    pub fn new(ledger: Arc<Ledger>, locks: Arc<LockManager>) -> Self {
        Self { ledger, locks }
    }

    /// Debits the verification price. Overdrafts are rejected with nothing
    /// written; a repeated purchase of the same verification returns the
    /// original debit.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<PurchaseReceipt> {
        if request.verification_id.trim().is_empty() {
            return Err(AppError::Validation("verification_id is required".to_string()));
        }
        if request.amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }

        if let Some(existing) = self.ledger.verification(&request.verification_id).await? {
            return self.replay(&request, &existing).await;
        }

        let user_id = request.user_id;
        self.locks
            .with_account_lock(user_id, |handle| async move {
                self.purchase_locked(&handle, &request).await
            })
            .await
    }

    async fn purchase_locked(
        &self,
        handle: &LockHandle,
        request: &PurchaseRequest,
    ) -> Result<PurchaseReceipt> {
        // Another purchase may have committed while we waited for the lock.
        if let Some(existing) = self.ledger.verification(&request.verification_id).await? {
            return self.replay(request, &existing).await;
        }

        let account = self.ledger.account(request.user_id).await?;
        let debit = Transaction::debit(request.user_id, request.verification_id.clone(), request.amount);
        let verification = Verification::new(
            request.verification_id.clone(),
            request.user_id,
            debit.id,
            request.amount,
        );
        let notification = OutboxMessage::new(
            request.user_id,
            topics::VERIFICATION_DEBITED,
            json!({
                "verification_id": request.verification_id,
                "transaction_id": debit.id,
                "amount": request.amount,
            }),
        );

        let adjustment = AdjustmentRequest::new(debit, account.version)
            .with_verification(VerificationChange::Open(verification))
            .notify(notification);

        match self.ledger.adjust(handle, adjustment).await? {
            Adjustment::Applied {
                new_balance,
                transaction,
                ..
            } => {
                tracing::info!(
                    verification_id = %request.verification_id,
                    user_id = %request.user_id,
                    amount = %mask_amount(&request.amount),
                    "Verification purchased"
                );
                Ok(PurchaseReceipt {
                    verification_id: request.verification_id.clone(),
                    debit_transaction_id: transaction.id,
                    amount: request.amount,
                    balance: new_balance,
                    replayed: false,
                })
            }
            Adjustment::Duplicate(existing) => Ok(PurchaseReceipt {
                verification_id: request.verification_id.clone(),
                debit_transaction_id: existing.id,
                amount: existing.amount.abs(),
                balance: self.ledger.balance(request.user_id).await?,
                replayed: true,
            }),
        }
    }

    async fn replay(&self, request: &PurchaseRequest, existing: &Verification) -> Result<PurchaseReceipt> {
        if existing.user_id != request.user_id || existing.amount != request.amount {
            return Err(AppError::IdempotencyConflict(request.verification_id.clone()));
        }
        Ok(PurchaseReceipt {
            verification_id: existing.verification_id.clone(),
            debit_transaction_id: existing.debit_transaction_id,
            amount: existing.amount,
            balance: self.ledger.balance(existing.user_id).await?,
            replayed: true,
        })
    }

    /// Provisioning succeeded: the debit becomes final and can no longer be
    /// refunded. Loses cleanly against a refund that committed first.
    pub async fn confirm_delivery(&self, verification_id: &str) -> Result<DeliveryOutcome> {
        let verification = self.find(verification_id).await?;

        self.locks
            .with_account_lock(verification.user_id, |handle| async move {
                let current = self.find(verification_id).await?;
                match current.status {
                    VerificationStatus::Delivered => return Ok(DeliveryOutcome::AlreadyDelivered),
                    VerificationStatus::Refunded => return Ok(DeliveryOutcome::AlreadyRefunded),
                    VerificationStatus::Active => {}
                }

                match self.ledger.mark_delivered(&handle, &current).await? {
                    Some(_) => {
                        tracing::info!(verification_id = %verification_id, "Verification delivered");
                        Ok(DeliveryOutcome::Delivered)
                    }
                    None => match self.find(verification_id).await?.status {
                        VerificationStatus::Refunded => Ok(DeliveryOutcome::AlreadyRefunded),
                        _ => Ok(DeliveryOutcome::AlreadyDelivered),
                    },
                }
            })
            .await
    }

    pub async fn verification(&self, verification_id: &str) -> Result<Verification> {
        self.find(verification_id).await
    }

    async fn find(&self, verification_id: &str) -> Result<Verification> {
        self.ledger
            .verification(verification_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Verification '{}' not found", verification_id)))
    }

    /// The debit that paid for `verification_id`, if it was purchased.
    pub async fn debit_of(&self, verification_id: &str) -> Result<Option<Transaction>> {
        self.ledger
            .verification_transaction(verification_id, TransactionType::Debit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLockBackend, LockManagerConfig};
    use crate::repositories::InMemoryStore;
    use rust_decimal_macros::dec;

    async fn funded(amount: Decimal) -> (VerificationService, Arc<Ledger>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(Ledger::new(store));
        let locks = Arc::new(LockManager::new(
            Arc::new(InMemoryLockBackend::new()),
            LockManagerConfig::default(),
        ));
        let user_id = Uuid::new_v4();
        ledger.open_account(user_id).await.unwrap();

        if amount > Decimal::ZERO {
            let handle = locks.acquire_account(user_id).await.unwrap();
            let credit = Transaction::credit(user_id, Uuid::new_v4(), amount);
            ledger.adjust(&handle, AdjustmentRequest::new(credit, 0)).await.unwrap();
            locks.release(&handle).await.unwrap();
        }

        (VerificationService::new(ledger.clone(), locks), ledger, user_id)
    }

    fn purchase(user_id: Uuid, verification_id: &str, amount: Decimal) -> PurchaseRequest {
        PurchaseRequest {
            verification_id: verification_id.to_string(),
            user_id,
            amount,
        }
    }

    #[tokio::test]
    async fn test_purchase_debits_and_replays() {
        let (service, ledger, user_id) = funded(dec!(10.00)).await;

        let first = service.purchase(purchase(user_id, "ver_1", dec!(4.00))).await.unwrap();
        assert_eq!(first.balance, dec!(6.00));
        assert!(!first.replayed);

        let second = service.purchase(purchase(user_id, "ver_1", dec!(4.00))).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.debit_transaction_id, first.debit_transaction_id);
        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(6.00));
    }

    #[tokio::test]
    async fn test_purchase_with_changed_amount_conflicts() {
        let (service, _, user_id) = funded(dec!(10.00)).await;
        service.purchase(purchase(user_id, "ver_1", dec!(4.00))).await.unwrap();

        let err = service.purchase(purchase(user_id, "ver_1", dec!(5.00))).await.unwrap_err();
        assert!(matches!(err, AppError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_trace() {
        let (service, ledger, user_id) = funded(dec!(3.00)).await;

        let err = service.purchase(purchase(user_id, "ver_1", dec!(4.00))).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));
        assert!(service.debit_of("ver_1").await.unwrap().is_none());
        assert!(ledger.verification("ver_1").await.unwrap().is_none());
        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(3.00));
    }

    #[tokio::test]
    async fn test_confirm_delivery_is_idempotent() {
        let (service, _, user_id) = funded(dec!(10.00)).await;
        service.purchase(purchase(user_id, "ver_1", dec!(4.00))).await.unwrap();

        assert_eq!(service.confirm_delivery("ver_1").await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(
            service.confirm_delivery("ver_1").await.unwrap(),
            DeliveryOutcome::AlreadyDelivered
        );
        assert!(matches!(
            service.confirm_delivery("ver_missing").await,
            Err(AppError::NotFound(_))
        ));
    }
}
