pub mod payload;
pub mod processor;
pub mod verifier;

pub use payload::{WebhookEvent, WebhookStatus};
pub use processor::{
    AcceptedDelivery, ProcessingResult, WebhookProcessor, WebhookRetryJob, PROCESSING_LEASE,
};
pub use verifier::{SignatureVerifier, SIGNATURE_HEADER};
