pub mod in_memory;
pub mod ledger_repository;
pub mod outbox_repository;
pub mod payment_attempt_repository;
pub mod ports;
pub mod webhook_delivery_repository;

pub use in_memory::InMemoryStore;
pub use ledger_repository::PostgresLedgerStore;
pub use outbox_repository::PostgresOutboxStore;
pub use payment_attempt_repository::PostgresPaymentAttemptStore;
pub use ports::{
    CommitOutcome, LedgerStore, OutboxStore, PaymentAttemptStore, PaymentCompletion,
    TransactionTotals, UnitOfWork, VerificationChange, WebhookDeliveryStore,
};
pub use webhook_delivery_repository::PostgresWebhookDeliveryStore;
