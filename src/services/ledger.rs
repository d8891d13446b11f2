use crate::error::{AppError, Result};
use crate::lock::{account_resource, LockHandle};
use crate::models::{Account, OutboxMessage, Transaction, TransactionType, Verification};
use crate::observability::{get_metrics, mask_amount, raise_operator_alert, LatencyTimer};
use crate::repositories::{
    CommitOutcome, LedgerStore, PaymentCompletion, UnitOfWork, VerificationChange,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One balance change plus the bookkeeping that must commit with it.
#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub transaction: Transaction,
    /// Account version read while holding the lock.
    pub expected_version: i64,
    pub payment_completion: Option<PaymentCompletion>,
    pub verification: Option<VerificationChange>,
    pub notification: Option<OutboxMessage>,
}

impl AdjustmentRequest {
    pub fn new(transaction: Transaction, expected_version: i64) -> Self {
        Self {
            transaction,
            expected_version,
            payment_completion: None,
            verification: None,
            notification: None,
        }
    }

    pub fn completing(mut self, completion: PaymentCompletion) -> Self {
        self.payment_completion = Some(completion);
        self
    }

    pub fn with_verification(mut self, change: VerificationChange) -> Self {
        self.verification = Some(change);
        self
    }

    pub fn notify(mut self, message: OutboxMessage) -> Self {
        self.notification = Some(message);
        self
    }
}

/// Result of `Ledger::adjust`.
#[derive(Debug, Clone)]
pub enum Adjustment {
    Applied {
        new_balance: Decimal,
        new_version: i64,
        transaction: Transaction,
    },
    /// The causal parent already has a transaction of this type; nothing changed.
    Duplicate(Transaction),
}

/// Outcome of checking `balance == Σ transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub transaction_sum: Decimal,
    pub transaction_count: i64,
    pub balanced: bool,
    pub checked_at: DateTime<Utc>,
}

/// Balance aggregate and transaction log.
///
/// Every mutation goes through `adjust`, which requires a lock handle for the
/// account and commits the balance change, its transaction row and any
/// attached bookkeeping as a single unit of work.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Creates the zero-balance account for a new user; repeat calls return it.
    pub async fn open_account(&self, user_id: Uuid) -> Result<Account> {
        let account = self.store.open_account(user_id).await?;
        tracing::info!(user_id = %user_id, "Account opened");
        Ok(account)
    }

    pub async fn account(&self, user_id: Uuid) -> Result<Account> {
        self.store
            .find_account(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", user_id)))
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<Decimal> {
        Ok(self.account(user_id).await?.balance)
    }

    pub async fn transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        self.store.find_transactions(user_id).await
    }

    pub async fn verification(&self, verification_id: &str) -> Result<Option<Verification>> {
        self.store.find_verification(verification_id).await
    }

    pub async fn verification_transaction(
        &self,
        verification_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Transaction>> {
        self.store
            .find_verification_transaction(verification_id, transaction_type)
            .await
    }

    pub async fn mark_delivered(
        &self,
        handle: &LockHandle,
        verification: &Verification,
    ) -> Result<Option<Verification>> {
        Self::check_handle(handle, verification.user_id)?;
        self.store
            .mark_verification_delivered(&verification.verification_id)
            .await
    }

    fn check_handle(handle: &LockHandle, user_id: Uuid) -> Result<()> {
        if !handle.covers(&account_resource(user_id)) {
            return Err(AppError::InvariantViolation(format!(
                "lock '{}' does not cover account {}",
                handle.resource_key, user_id
            )));
        }
        if handle.is_expired() {
            return Err(AppError::StaleFencingToken {
                user_id,
                token: handle.fencing_token,
                current: handle.fencing_token,
            });
        }
        Ok(())
    }

    /// Applies `request` to the account named by its transaction.
    ///
    /// Debits that would overdraw are rejected with nothing written. A stored
    /// version or fencing token that moved since the caller read it is a
    /// transient conflict.
    pub async fn adjust(&self, handle: &LockHandle, request: AdjustmentRequest) -> Result<Adjustment> {
        let user_id = request.transaction.account_user_id;
        let kind = request.transaction.transaction_type.as_str();
        Self::check_handle(handle, user_id)?;

        if !request.transaction.has_valid_parent() {
            return Err(AppError::InvariantViolation(format!(
                "{} transaction {} has no valid causal parent",
                kind, request.transaction.id
            )));
        }

        let delta = request.transaction.amount;
        let unit = UnitOfWork {
            user_id,
            delta,
            expected_version: request.expected_version,
            fencing_token: handle.fencing_token,
            transaction: request.transaction,
            payment_completion: request.payment_completion,
            verification: request.verification,
            notification: request.notification,
        };

        let timer = LatencyTimer::new();
        let outcome = match self.store.commit(unit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                get_metrics().record_ledger_rejection(kind, e.code());
                if matches!(e, AppError::InvariantViolation(_)) {
                    raise_operator_alert("ledger_invariant", &e.to_string());
                }
                return Err(e);
            }
        };
        get_metrics().record_ledger_commit_latency(timer.elapsed_ms());

        match outcome {
            CommitOutcome::Committed {
                account,
                transaction,
            } => {
                if account.version != request.expected_version + 1 {
                    raise_operator_alert(
                        "ledger_version_skew",
                        &format!(
                            "account {} committed at version {} but {} was expected",
                            user_id,
                            account.version,
                            request.expected_version + 1
                        ),
                    );
                }
                get_metrics().record_ledger_commit(kind);
                tracing::info!(
                    user_id = %user_id,
                    transaction_id = %transaction.id,
                    transaction_type = kind,
                    amount = %mask_amount(&delta),
                    version = account.version,
                    fencing_token = handle.fencing_token,
                    "Ledger adjusted"
                );
                Ok(Adjustment::Applied {
                    new_balance: account.balance,
                    new_version: account.version,
                    transaction,
                })
            }
            CommitOutcome::Duplicate(existing) => {
                tracing::info!(
                    user_id = %user_id,
                    transaction_id = %existing.id,
                    transaction_type = kind,
                    "Duplicate adjustment ignored"
                );
                Ok(Adjustment::Duplicate(existing))
            }
            CommitOutcome::InsufficientFunds { balance } => {
                get_metrics().record_ledger_rejection(kind, "insufficient_funds");
                Err(AppError::InsufficientFunds {
                    requested: delta.abs(),
                    available: balance,
                })
            }
            CommitOutcome::VersionConflict { actual } => {
                get_metrics().record_ledger_rejection(kind, "version_conflict");
                Err(AppError::VersionConflict {
                    user_id,
                    expected: request.expected_version,
                    actual,
                })
            }
            CommitOutcome::StaleFence { current } => {
                get_metrics().record_ledger_rejection(kind, "stale_fence");
                tracing::warn!(
                    user_id = %user_id,
                    token = handle.fencing_token,
                    current,
                    "Rejected write from stale lock holder"
                );
                Err(AppError::StaleFencingToken {
                    user_id,
                    token: handle.fencing_token,
                    current,
                })
            }
            CommitOutcome::AccountMissing => {
                Err(AppError::NotFound(format!("Account '{}' not found", user_id)))
            }
        }
    }

    /// Checks the reconciliation invariant for one account. A mismatch raises
    /// an operator alert.
    pub async fn reconcile(&self, user_id: Uuid) -> Result<ReconciliationReport> {
        let account = self.account(user_id).await?;
        let totals = self.store.transaction_totals(user_id).await?;

        let report = ReconciliationReport {
            user_id,
            balance: account.balance,
            transaction_sum: totals.sum,
            transaction_count: totals.count,
            balanced: account.balance == totals.sum,
            checked_at: Utc::now(),
        };

        if !report.balanced {
            raise_operator_alert(
                "reconciliation_mismatch",
                &format!(
                    "account {} balance {} != transaction sum {}",
                    user_id, report.balance, report.transaction_sum
                ),
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{InMemoryLockBackend, LockManager, LockManagerConfig};
    use crate::repositories::InMemoryStore;
    use rust_decimal_macros::dec;

    async fn setup() -> (Ledger, LockManager, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Ledger::new(store);
        let locks = LockManager::new(Arc::new(InMemoryLockBackend::new()), LockManagerConfig::default());
        let user_id = Uuid::new_v4();
        ledger.open_account(user_id).await.unwrap();
        (ledger, locks, user_id)
    }

    #[tokio::test]
    async fn test_credit_then_debit() {
        let (ledger, locks, user_id) = setup().await;
        let handle = locks.acquire_account(user_id).await.unwrap();

        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(10.00));
        let applied = ledger.adjust(&handle, AdjustmentRequest::new(credit, 0)).await.unwrap();
        assert!(matches!(applied, Adjustment::Applied { new_balance, new_version: 1, .. } if new_balance == dec!(10.00)));

        let debit = Transaction::debit(user_id, "ver_1", dec!(4.00));
        ledger.adjust(&handle, AdjustmentRequest::new(debit, 1)).await.unwrap();

        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(6.00));
        assert!(ledger.reconcile(user_id).await.unwrap().balanced);
    }

    #[tokio::test]
    async fn test_reconcile_reports_store_totals() {
        let (ledger, locks, user_id) = setup().await;
        let empty = ledger.reconcile(user_id).await.unwrap();
        assert_eq!((empty.transaction_sum, empty.transaction_count), (dec!(0), 0));
        assert!(empty.balanced);

        let handle = locks.acquire_account(user_id).await.unwrap();
        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(7.50));
        ledger.adjust(&handle, AdjustmentRequest::new(credit, 0)).await.unwrap();
        let debit = Transaction::debit(user_id, "ver_totals", dec!(2.25));
        ledger.adjust(&handle, AdjustmentRequest::new(debit, 1)).await.unwrap();

        let report = ledger.reconcile(user_id).await.unwrap();
        assert_eq!(report.transaction_sum, dec!(5.25));
        assert_eq!(report.transaction_count, 2);
        assert_eq!(report.balance, report.transaction_sum);
        assert!(report.balanced);
    }

    #[tokio::test]
    async fn test_overdraft_rejected_without_side_effects() {
        let (ledger, locks, user_id) = setup().await;
        let handle = locks.acquire_account(user_id).await.unwrap();

        let debit = Transaction::debit(user_id, "ver_1", dec!(5.00));
        let err = ledger.adjust(&handle, AdjustmentRequest::new(debit, 0)).await.unwrap_err();

        match err {
            AppError::InsufficientFunds { requested, available } => {
                assert_eq!(requested, dec!(5.00));
                assert_eq!(available, dec!(0));
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }
        assert!(ledger.transactions(user_id).await.unwrap().is_empty());
        assert_eq!(ledger.account(user_id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_transient_conflict() {
        let (ledger, locks, user_id) = setup().await;
        let handle = locks.acquire_account(user_id).await.unwrap();

        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(1.00));
        let err = ledger.adjust(&handle, AdjustmentRequest::new(credit, 7)).await.unwrap_err();
        assert!(matches!(err, AppError::VersionConflict { expected: 7, actual: 0, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_superseded_lock_holder_is_fenced_off() {
        let (ledger, locks, user_id) = setup().await;
        let stale = locks.acquire_account(user_id).await.unwrap();
        locks.release(&stale).await.unwrap();
        let current = locks.acquire_account(user_id).await.unwrap();

        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(1.00));
        ledger.adjust(&current, AdjustmentRequest::new(credit, 0)).await.unwrap();

        let late = Transaction::credit(user_id, Uuid::new_v4(), dec!(1.00));
        let err = ledger.adjust(&stale, AdjustmentRequest::new(late, 1)).await.unwrap_err();
        assert!(matches!(err, AppError::StaleFencingToken { .. }));
        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(1.00));
    }

    #[tokio::test]
    async fn test_lost_fence_counter_heals_after_one_rejection() {
        let (ledger, locks, user_id) = setup().await;
        for i in 0..3 {
            let handle = locks.acquire_account(user_id).await.unwrap();
            let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(1.00));
            ledger.adjust(&handle, AdjustmentRequest::new(credit, i)).await.unwrap();
            locks.release(&handle).await.unwrap();
        }

        // A fresh backend restarts its counter below the stored token.
        let reset = LockManager::new(Arc::new(InMemoryLockBackend::new()), LockManagerConfig::default());
        let write = |handle: LockHandle| {
            let ledger = &ledger;
            async move {
                let debit = Transaction::debit(user_id, "ver_fence", dec!(1.00));
                ledger.adjust(&handle, AdjustmentRequest::new(debit, 3)).await
            }
        };

        let err = reset.with_account_lock(user_id, write).await.unwrap_err();
        match err {
            AppError::StaleFencingToken { token, current, .. } => {
                assert_eq!(token, 1);
                assert_eq!(current, 3);
            }
            other => panic!("expected stale fence, got {:?}", other),
        }
        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(3.00));

        reset.with_account_lock(user_id, write).await.unwrap();
        assert_eq!(ledger.balance(user_id).await.unwrap(), dec!(2.00));
        assert_eq!(ledger.account(user_id).await.unwrap().fencing_token, 4);
    }

    #[tokio::test]
    async fn test_handle_for_other_account_rejected() {
        let (ledger, locks, user_id) = setup().await;
        let other = locks.acquire_account(Uuid::new_v4()).await.unwrap();

        let credit = Transaction::credit(user_id, Uuid::new_v4(), dec!(1.00));
        let err = ledger.adjust(&other, AdjustmentRequest::new(credit, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
    }
}
