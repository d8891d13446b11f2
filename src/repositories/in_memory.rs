use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Account, DeliveryStatus, OutboxMessage, OutboxStatus, PaymentAttempt, PaymentState,
    StateTransition, Transaction, TransactionType, Verification, VerificationStatus,
    WebhookDeliveryLog,
};
use crate::repositories::ports::{
    CommitOutcome, LedgerStore, OutboxStore, PaymentAttemptStore, TransactionTotals, UnitOfWork,
    VerificationChange, WebhookDeliveryStore,
};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    transactions: Vec<Transaction>,
    attempts: HashMap<Uuid, PaymentAttempt>,
    verifications: HashMap<String, Verification>,
    deliveries: HashMap<Uuid, WebhookDeliveryLog>,
    outbox: Vec<OutboxMessage>,
}

impl State {
    /// Mirrors the partial unique indexes on `transactions`.
    fn find_duplicate(&self, candidate: &Transaction) -> Option<Transaction> {
        self.transactions
            .iter()
            .find(|existing| {
                existing.transaction_type == candidate.transaction_type
                    && match candidate.transaction_type {
                        TransactionType::Credit => {
                            existing.payment_attempt_id == candidate.payment_attempt_id
                        }
                        TransactionType::Debit | TransactionType::Refund => {
                            existing.verification_id == candidate.verification_id
                        }
                    }
            })
            .cloned()
    }
}

/// In-process implementation of every storage port.
///
/// A single mutex guards all tables, so each unit of work is applied in one
/// critical section with the same all-or-nothing semantics as the Postgres
/// store. Intended for tests and single-node development.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every ledger commit fail with a storage error until switched back.
    pub fn simulate_outage(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// Number of stored transactions of the given type, across all accounts.
    pub async fn count_transactions(&self, transaction_type: TransactionType) -> usize {
        let state = self.state.lock().await;
        state
            .transactions
            .iter()
            .filter(|t| t.transaction_type == transaction_type)
            .count()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn open_account(&self, user_id: Uuid) -> Result<Account> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .entry(user_id)
            .or_insert_with(|| Account::new(user_id));
        Ok(account.clone())
    }

    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&user_id).cloned())
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        self.check_available()?;

        if unit.delta != unit.transaction.amount {
            return Err(AppError::InvariantViolation(format!(
                "delta {} does not match transaction amount {}",
                unit.delta, unit.transaction.amount
            )));
        }

        let account = match state.accounts.get(&unit.user_id) {
            Some(account) => account.clone(),
            None => return Ok(CommitOutcome::AccountMissing),
        };

        if account.version != unit.expected_version {
            return Ok(CommitOutcome::VersionConflict {
                actual: account.version,
            });
        }
        if !account.accepts_fencing_token(unit.fencing_token) {
            return Ok(CommitOutcome::StaleFence {
                current: account.fencing_token,
            });
        }
        if let Some(existing) = state.find_duplicate(&unit.transaction) {
            return Ok(CommitOutcome::Duplicate(existing));
        }
        if !account.can_apply(unit.delta) {
            return Ok(CommitOutcome::InsufficientFunds {
                balance: account.balance,
            });
        }

        // Validate the dependent writes before touching anything.
        if let Some(completion) = &unit.payment_completion {
            match state.attempts.get(&completion.attempt_id) {
                Some(attempt) if attempt.state == PaymentState::Processing => {}
                _ => {
                    return Err(AppError::InvariantViolation(format!(
                        "payment attempt {} is not processing",
                        completion.attempt_id
                    )))
                }
            }
        }
        if let Some(VerificationChange::MarkRefunded { verification_id }) = &unit.verification {
            match state.verifications.get(verification_id) {
                Some(v) if v.status == VerificationStatus::Active => {}
                _ => {
                    return Err(AppError::InvariantViolation(format!(
                        "verification {} is not active",
                        verification_id
                    )))
                }
            }
        }

        let now = Utc::now();
        let mut updated = account;
        updated.balance += unit.delta;
        updated.version += 1;
        updated.fencing_token = unit.fencing_token;
        updated.updated_at = now;
        state.accounts.insert(unit.user_id, updated.clone());
        state.transactions.push(unit.transaction.clone());

        if let Some(completion) = unit.payment_completion {
            if let Some(attempt) = state.attempts.get_mut(&completion.attempt_id) {
                attempt.record(completion.transition);
            }
        }
        match unit.verification {
            Some(VerificationChange::Open(verification)) => {
                state
                    .verifications
                    .insert(verification.verification_id.clone(), verification);
            }
            Some(VerificationChange::MarkRefunded { verification_id }) => {
                if let Some(v) = state.verifications.get_mut(&verification_id) {
                    v.status = VerificationStatus::Refunded;
                    v.updated_at = now;
                }
            }
            None => {}
        }
        if let Some(message) = unit.notification {
            state.outbox.push(message);
        }

        Ok(CommitOutcome::Committed {
            account: updated,
            transaction: unit.transaction,
        })
    }

    async fn find_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.account_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn transaction_totals(&self, user_id: Uuid) -> Result<TransactionTotals> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.account_user_id == user_id)
            .fold(TransactionTotals { sum: Decimal::ZERO, count: 0 }, |acc, t| TransactionTotals {
                sum: acc.sum + t.amount,
                count: acc.count + 1,
            }))
    }

    async fn find_verification_transaction(
        &self,
        verification_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| {
                t.transaction_type == transaction_type
                    && t.verification_id.as_deref() == Some(verification_id)
            })
            .cloned())
    }

    async fn find_verification(&self, verification_id: &str) -> Result<Option<Verification>> {
        let state = self.state.lock().await;
        Ok(state.verifications.get(verification_id).cloned())
    }

    async fn mark_verification_delivered(
        &self,
        verification_id: &str,
    ) -> Result<Option<Verification>> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        match state.verifications.get_mut(verification_id) {
            Some(v) if v.status == VerificationStatus::Active => {
                v.status = VerificationStatus::Delivered;
                v.updated_at = Utc::now();
                Ok(Some(v.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl PaymentAttemptStore for InMemoryStore {
    async fn insert(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .attempts
            .values()
            .find(|a| a.idempotency_key == attempt.idempotency_key)
        {
            return Ok(existing.clone());
        }
        if state
            .attempts
            .values()
            .any(|a| a.external_reference == attempt.external_reference)
        {
            return Err(AppError::Validation(format!(
                "external reference '{}' already exists",
                attempt.external_reference
            )));
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .values()
            .find(|a| a.external_reference == reference)
            .cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentAttempt>> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .values()
            .find(|a| a.idempotency_key == key)
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: PaymentState,
        transition: StateTransition,
    ) -> Result<Option<PaymentAttempt>> {
        let mut state = self.state.lock().await;
        self.check_available()?;
        match state.attempts.get_mut(&id) {
            Some(attempt) if attempt.state == from => {
                attempt.record(transition);
                Ok(Some(attempt.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl WebhookDeliveryStore for InMemoryStore {
    async fn insert(&self, log: &WebhookDeliveryLog) -> Result<()> {
        let mut state = self.state.lock().await;
        state.deliveries.insert(log.id, log.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>> {
        let state = self.state.lock().await;
        Ok(state.deliveries.get(&id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryLog>> {
        let mut state = self.state.lock().await;
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let mut due: Vec<&mut WebhookDeliveryLog> = state
            .deliveries
            .values_mut()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.next_retry_at.map(|at| at <= now).unwrap_or(false)
            })
            .collect();
        due.sort_by_key(|d| d.next_retry_at);

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|d| {
                d.next_retry_at = Some(lease_until);
                d.updated_at = now;
                d.clone()
            })
            .collect())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&id) {
            Some(d) if d.status == DeliveryStatus::Pending => {
                d.attempt_count = attempt_count;
                d.next_retry_at = Some(next_retry_at);
                d.last_error = Some(error.to_string());
                d.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(&self, id: Uuid, attempt_count: i32) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&id) {
            Some(d) => {
                d.status = DeliveryStatus::Processed;
                d.processed = true;
                d.attempt_count = attempt_count;
                d.next_retry_at = None;
                d.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_dead_lettered(&self, id: Uuid, attempt_count: i32, error: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&id) {
            Some(d) if d.status == DeliveryStatus::Pending => {
                d.status = DeliveryStatus::DeadLettered;
                d.attempt_count = attempt_count;
                d.next_retry_at = None;
                d.last_error = Some(error.to_string());
                d.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>> {
        let mut state = self.state.lock().await;
        match state.deliveries.get_mut(&id) {
            Some(d) if d.status == DeliveryStatus::DeadLettered && d.signature_valid => {
                let now = Utc::now();
                d.status = DeliveryStatus::Pending;
                d.attempt_count = 0;
                d.next_retry_at = Some(now);
                d.updated_at = now;
                Ok(Some(d.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<WebhookDeliveryLog>> {
        let state = self.state.lock().await;
        let mut dead: Vec<WebhookDeliveryLog> = state
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::DeadLettered)
            .cloned()
            .collect();
        dead.sort_by_key(|d| d.created_at);
        dead.truncate(limit.max(0) as usize);
        Ok(dead)
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>> {
        let mut state = self.state.lock().await;
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(state
            .outbox
            .iter_mut()
            .filter(|m| m.status == OutboxStatus::Pending && m.next_attempt_at <= now)
            .take(limit.max(0) as usize)
            .map(|m| {
                m.next_attempt_at = lease_until;
                m.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.outbox.iter_mut().find(|m| m.id == id) {
            m.status = OutboxStatus::Delivered;
            m.attempts += 1;
            m.delivered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.outbox.iter_mut().find(|m| m.id == id) {
            m.attempts = attempts;
            m.next_attempt_at = next_attempt_at;
            m.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(m) = state.outbox.iter_mut().find(|m| m.id == id) {
            m.status = OutboxStatus::Failed;
            m.attempts = attempts;
            m.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<OutboxMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn credit_unit(account: &Account, amount: Decimal) -> UnitOfWork {
        let transaction = Transaction::credit(account.user_id, Uuid::new_v4(), amount);
        UnitOfWork {
            user_id: account.user_id,
            delta: transaction.amount,
            expected_version: account.version,
            fencing_token: 1,
            transaction,
            payment_completion: None,
            verification: None,
            notification: None,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_balance_and_transaction() {
        let store = InMemoryStore::new();
        let account = store.open_account(Uuid::new_v4()).await.unwrap();

        let outcome = store.commit(credit_unit(&account, dec!(12.50))).await.unwrap();
        match outcome {
            CommitOutcome::Committed { account, .. } => {
                assert_eq!(account.balance, dec!(12.50));
                assert_eq!(account.version, 1);
                assert_eq!(account.fencing_token, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let totals = store.transaction_totals(account.user_id).await.unwrap();
        assert_eq!(totals, TransactionTotals { sum: dec!(12.50), count: 1 });
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = InMemoryStore::new();
        let account = store.open_account(Uuid::new_v4()).await.unwrap();
        store.commit(credit_unit(&account, dec!(1))).await.unwrap();

        // Reuses version 0 after the first commit bumped it to 1.
        let outcome = store.commit(credit_unit(&account, dec!(1))).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::VersionConflict { actual: 1 }));
        assert_eq!(store.transaction_totals(account.user_id).await.unwrap().sum, dec!(1));
    }

    #[tokio::test]
    async fn test_commit_rejects_overdraft_without_side_effects() {
        let store = InMemoryStore::new();
        let account = store.open_account(Uuid::new_v4()).await.unwrap();
        let debit = Transaction::debit(account.user_id, "ver-1", dec!(5));
        let unit = UnitOfWork {
            user_id: account.user_id,
            delta: debit.amount,
            expected_version: 0,
            fencing_token: 1,
            transaction: debit,
            payment_completion: None,
            verification: None,
            notification: Some(OutboxMessage::new(account.user_id, "x", serde_json::json!({}))),
        };

        let outcome = store.commit(unit).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::InsufficientFunds { .. }));
        assert!(store.find_transactions(account.user_id).await.unwrap().is_empty());
        assert!(store.find_by_user(account.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_commit() {
        let store = InMemoryStore::new();
        let account = store.open_account(Uuid::new_v4()).await.unwrap();
        store.simulate_outage(true);

        let err = store.commit(credit_unit(&account, dec!(1))).await.unwrap_err();
        assert!(err.is_transient());

        store.simulate_outage(false);
        assert!(store.commit(credit_unit(&account, dec!(1))).await.is_ok());
    }
}
