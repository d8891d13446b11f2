//! Storage ports. Every instance of the service talks to the same backing store
//! through these traits, so no correctness property relies on process memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Account, OutboxMessage, PaymentAttempt, PaymentState, StateTransition, Transaction,
    TransactionType, Verification, WebhookDeliveryLog,
};

/// Moves a `processing` payment attempt to `completed` alongside its credit.
#[derive(Debug, Clone)]
pub struct PaymentCompletion {
    pub attempt_id: Uuid,
    pub transition: StateTransition,
}

/// Verification bookkeeping that must commit with the balance change.
#[derive(Debug, Clone)]
pub enum VerificationChange {
    /// Record a new purchase (with its debit).
    Open(Verification),
    /// Flip an active verification to refunded (with its refund).
    MarkRefunded { verification_id: String },
}

/// Everything a single balance mutation writes. Stores apply it as one local
/// durable transaction: either all of it is visible afterwards or none of it is.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub user_id: Uuid,
    pub delta: Decimal,
    pub expected_version: i64,
    pub fencing_token: i64,
    pub transaction: Transaction,
    pub payment_completion: Option<PaymentCompletion>,
    pub verification: Option<VerificationChange>,
    pub notification: Option<OutboxMessage>,
}

/// Result of attempting a unit of work.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Committed {
        account: Account,
        transaction: Transaction,
    },
    /// The stored version moved since the caller read it.
    VersionConflict { actual: i64 },
    /// A newer lock holder has already written to the account.
    StaleFence { current: i64 },
    /// The debit would take the balance below zero.
    InsufficientFunds { balance: Decimal },
    /// A transaction with the same causal parent and type already exists.
    Duplicate(Transaction),
    AccountMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionTotals {
    pub sum: Decimal,
    pub count: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Creates the zero-balance account if it does not exist yet.
    async fn open_account(&self, user_id: Uuid) -> Result<Account>;

    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>>;

    async fn commit(&self, unit: UnitOfWork) -> Result<CommitOutcome>;

    /// Transactions for an account, oldest first.
    async fn find_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>>;

    /// Sum and count of an account's transactions, aggregated by the store.
    async fn transaction_totals(&self, user_id: Uuid) -> Result<TransactionTotals>;

    async fn find_verification_transaction(
        &self,
        verification_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Transaction>>;

    async fn find_verification(&self, verification_id: &str) -> Result<Option<Verification>>;

    /// Active → delivered. Returns the updated row, or `None` if it was not active.
    async fn mark_verification_delivered(
        &self,
        verification_id: &str,
    ) -> Result<Option<Verification>>;
}

#[async_trait]
pub trait PaymentAttemptStore: Send + Sync {
    /// Inserts the attempt. If an attempt with the same idempotency key already
    /// exists, that one is returned unchanged instead.
    async fn insert(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentAttempt>>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentAttempt>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentAttempt>>;

    /// Compare-and-set transition. Returns `None` when the attempt is not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: PaymentState,
        transition: StateTransition,
    ) -> Result<Option<PaymentAttempt>>;
}

#[async_trait]
pub trait WebhookDeliveryStore: Send + Sync {
    async fn insert(&self, log: &WebhookDeliveryLog) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>>;

    /// Pending deliveries due at `now`; their `next_retry_at` is pushed out by
    /// `lease` so other sweepers skip them while they are being worked on.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryLog>>;

    /// Records a failed attempt on a still-pending delivery.
    async fn schedule_retry(
        &self,
        id: Uuid,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;

    async fn mark_processed(&self, id: Uuid, attempt_count: i32) -> Result<bool>;

    async fn mark_dead_lettered(&self, id: Uuid, attempt_count: i32, error: &str) -> Result<bool>;

    /// Dead-lettered → pending with a fresh attempt budget.
    async fn reset_dead_letter(&self, id: Uuid) -> Result<Option<WebhookDeliveryLog>>;

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<WebhookDeliveryLog>>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending messages due at `now`, leased for `lease`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>>;

    async fn mark_delivered(&self, id: Uuid) -> Result<()>;

    async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()>;

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<OutboxMessage>>;
}
