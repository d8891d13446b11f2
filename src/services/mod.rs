pub mod ledger;
pub mod payment_service;
pub mod payment_state_machine;
pub mod refund_orchestrator;
pub mod verification_service;

pub use ledger::{Adjustment, AdjustmentRequest, Ledger, ReconciliationReport};
pub use payment_service::{
    InitializePayment, PaymentInitialized, PaymentOutcome, PaymentService, NO_CHARGE_MESSAGE,
};
pub use payment_state_machine::PaymentStateMachine;
pub use refund_orchestrator::{RefundOrchestrator, RefundOutcome};
pub use verification_service::{
    DeliveryOutcome, PurchaseReceipt, PurchaseRequest, VerificationService,
};
