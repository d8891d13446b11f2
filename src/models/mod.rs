pub mod account;
pub mod outbox;
pub mod payment_attempt;
pub mod transaction;
pub mod verification;
pub mod webhook_delivery;

pub use account::Account;
pub use outbox::{topics, OutboxMessage, OutboxStatus};
pub use payment_attempt::{PaymentAttempt, PaymentState, StateTransition};
pub use transaction::{Transaction, TransactionType};
pub use verification::{RefundReason, Verification, VerificationStatus};
pub use webhook_delivery::{payload_hash, DeliveryStatus, WebhookDeliveryLog};
