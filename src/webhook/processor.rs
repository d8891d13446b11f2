use crate::error::{AppError, ErrorClass, Result};
use crate::idempotency::{IdempotencyGuard, IdempotencyKeyGenerator, IdempotencyScope};
use crate::models::{DeliveryStatus, WebhookDeliveryLog};
use crate::observability::{get_metrics, raise_operator_alert};
use crate::repositories::WebhookDeliveryStore;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::services::{PaymentOutcome, PaymentService};
use crate::webhook::payload::WebhookEvent;
use crate::webhook::verifier::SignatureVerifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a delivery stays invisible to the sweeper while a worker owns it.
pub const PROCESSING_LEASE: Duration = Duration::from_secs(30);

/// A delivery that passed signature and payload checks and is durably queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedDelivery {
    pub delivery_id: Uuid,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessingResult {
    Processed {
        outcome: PaymentOutcome,
        /// The event id had already been applied; the stored outcome was returned.
        replayed: bool,
    },
    RetryScheduled {
        attempt: i32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        reason: String,
    },
    /// The delivery was no longer pending.
    Skipped {
        status: DeliveryStatus,
    },
}

/// Identity of an event for duplicate detection: a redelivery of the same
/// event id must describe the same payment change.
#[derive(Serialize)]
struct EventFingerprint<'a> {
    reference: &'a str,
    amount: String,
    status: crate::webhook::payload::WebhookStatus,
}

/// Accepts signed provider deliveries and drives them to `processed` or the
/// dead-letter queue.
pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    deliveries: Arc<dyn WebhookDeliveryStore>,
    payments: Arc<PaymentService>,
    guard: Arc<IdempotencyGuard>,
    keys: IdempotencyKeyGenerator,
    retry: RetryPolicy,
}

impl WebhookProcessor {
    pub fn new(
        verifier: SignatureVerifier,
        deliveries: Arc<dyn WebhookDeliveryStore>,
        payments: Arc<PaymentService>,
        guard: Arc<IdempotencyGuard>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            verifier,
            deliveries,
            payments,
            guard,
            keys: IdempotencyKeyGenerator::default(),
            retry,
        }
    }

    /// Verifies and durably records a delivery. Runs no business logic.
    ///
    /// Unsigned or tampered bodies are logged as rejected and fail with
    /// `SignatureInvalid`; the body is not even parsed. Signed bodies that do
    /// not parse are dead-lettered and fail with `MalformedPayload`.
    pub async fn accept(&self, raw_body: &[u8], signature: Option<&str>) -> Result<AcceptedDelivery> {
        if let Err(e) = self.verifier.verify(raw_body, signature) {
            get_metrics().record_webhook_received("signature_invalid");
            tracing::warn!(
                body_bytes = raw_body.len(),
                signature_present = signature.is_some(),
                "Rejected webhook with invalid signature"
            );
            self.record_rejection(WebhookDeliveryLog::rejected(raw_body, false, e.to_string()))
                .await;
            return Err(e);
        }

        let event = match WebhookEvent::parse(raw_body) {
            Ok(event) => event,
            Err(e) => {
                get_metrics().record_webhook_received("malformed");
                get_metrics().record_webhook_dead_lettered("malformed");
                tracing::warn!(error = %e, "Dead-lettered malformed webhook");
                self.record_rejection(WebhookDeliveryLog::rejected(raw_body, true, e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let mut log = WebhookDeliveryLog::accepted(event.event_id.clone(), raw_body);
        // The immediate processing task owns the delivery first; the sweeper
        // only picks it up if that task never finishes.
        log.next_retry_at = Some(Utc::now() + lease());
        self.deliveries.insert(&log).await?;

        get_metrics().record_webhook_received("accepted");
        tracing::info!(
            delivery_id = %log.id,
            event_id = %event.event_id,
            reference = %event.reference,
            "Webhook accepted"
        );

        Ok(AcceptedDelivery {
            delivery_id: log.id,
            event_id: event.event_id,
        })
    }

    async fn record_rejection(&self, log: WebhookDeliveryLog) {
        if let Err(e) = self.deliveries.insert(&log).await {
            tracing::error!(error = %e, "Failed to record rejected webhook");
        }
    }

    /// Runs one processing attempt for a stored delivery.
    pub async fn process_delivery(&self, delivery_id: Uuid) -> Result<ProcessingResult> {
        let log = self.find(delivery_id).await?;
        if log.status != DeliveryStatus::Pending {
            return Ok(ProcessingResult::Skipped { status: log.status });
        }
        self.attempt(log).await
    }

    async fn attempt(&self, log: WebhookDeliveryLog) -> Result<ProcessingResult> {
        let attempt = log.attempt_count + 1;

        match self.apply(&log).await {
            Ok((outcome, replayed)) => {
                self.deliveries.mark_processed(log.id, attempt).await?;
                get_metrics().record_webhook_processed(if replayed { "replayed" } else { "applied" });
                tracing::info!(
                    delivery_id = %log.id,
                    event_id = log.event_id.as_deref().unwrap_or_default(),
                    attempt,
                    replayed,
                    "Webhook processed"
                );
                Ok(ProcessingResult::Processed { outcome, replayed })
            }
            Err(e) => self.handle_failure(&log, attempt, e).await,
        }
    }

    async fn apply(&self, log: &WebhookDeliveryLog) -> Result<(PaymentOutcome, bool)> {
        let event = WebhookEvent::parse(log.payload.as_bytes())?;
        let key = self.keys.from_event_id(&event.event_id)?;
        let fingerprint = self.keys.fingerprint(&EventFingerprint {
            reference: &event.reference,
            amount: event.amount.normalize().to_string(),
            status: event.status,
        })?;

        let result = self
            .guard
            .execute(&key, IdempotencyScope::Webhook, &fingerprint, || {
                self.payments.apply_event(&event)
            })
            .await?;
        let replayed = result.is_replay();
        Ok((result.into_inner(), replayed))
    }

    async fn handle_failure(
        &self,
        log: &WebhookDeliveryLog,
        attempt: i32,
        error: AppError,
    ) -> Result<ProcessingResult> {
        let reason = error.to_string();

        match self.retry.decide(&error, attempt.max(0) as u32) {
            RetryDecision::RetryAfter(delay) => {
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.deliveries
                    .schedule_retry(log.id, attempt, next_retry_at, &reason)
                    .await?;
                get_metrics().record_retry("webhook");
                tracing::warn!(
                    delivery_id = %log.id,
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Webhook processing failed, retry scheduled"
                );
                Ok(ProcessingResult::RetryScheduled {
                    attempt,
                    next_retry_at,
                })
            }
            RetryDecision::GiveUp => {
                self.deliveries
                    .mark_dead_lettered(log.id, attempt, &reason)
                    .await?;
                get_metrics().record_webhook_dead_lettered(error.code());

                let detail = format!(
                    "delivery {} (event {}) dead-lettered after {} attempt(s): {}",
                    log.id,
                    log.event_id.as_deref().unwrap_or("-"),
                    attempt,
                    reason
                );
                match error.classify() {
                    ErrorClass::Transient => raise_operator_alert("webhook_retries_exhausted", &detail),
                    ErrorClass::Permanent => tracing::warn!(
                        delivery_id = %log.id,
                        code = error.code(),
                        "{}",
                        detail
                    ),
                }
                Ok(ProcessingResult::DeadLettered { reason })
            }
        }
    }

    /// Claims and processes deliveries whose retry time has passed.
    pub async fn process_due(&self, limit: i64) -> Result<Vec<ProcessingResult>> {
        let due = self
            .deliveries
            .claim_due(Utc::now(), PROCESSING_LEASE, limit)
            .await?;

        let mut results = Vec::with_capacity(due.len());
        for log in due {
            let delivery_id = log.id;
            match self.attempt(log).await {
                Ok(result) => results.push(result),
                // Left pending; the lease expires and a later sweep retries it.
                Err(e) => tracing::error!(delivery_id = %delivery_id, error = %e, "Webhook sweep attempt failed"),
            }
        }
        Ok(results)
    }

    /// Re-queues a dead-lettered delivery with a fresh attempt budget and
    /// processes it once. Deliveries that failed signature checks never
    /// qualify.
    pub async fn replay_dead_letter(&self, delivery_id: Uuid) -> Result<ProcessingResult> {
        let log = match self.deliveries.reset_dead_letter(delivery_id).await? {
            Some(log) => log,
            None => {
                let existing = self.find(delivery_id).await?;
                return Err(AppError::Validation(format!(
                    "delivery {} is {:?} and cannot be replayed",
                    delivery_id, existing.status
                )));
            }
        };

        tracing::info!(delivery_id = %delivery_id, "Replaying dead-lettered webhook");
        self.attempt(log).await
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<WebhookDeliveryLog>> {
        self.deliveries.list_dead_letters(limit).await
    }

    pub async fn delivery(&self, delivery_id: Uuid) -> Result<WebhookDeliveryLog> {
        self.find(delivery_id).await
    }

    async fn find(&self, delivery_id: Uuid) -> Result<WebhookDeliveryLog> {
        self.deliveries
            .find(delivery_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Webhook delivery '{}' not found", delivery_id)))
    }
}

fn lease() -> chrono::Duration {
    chrono::Duration::from_std(PROCESSING_LEASE).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Background sweeper that re-drives due deliveries.
pub struct WebhookRetryJob {
    processor: Arc<WebhookProcessor>,
    interval: Duration,
    batch_size: i64,
}

impl WebhookRetryJob {
    pub fn new(processor: Arc<WebhookProcessor>, interval: Duration, batch_size: i64) -> Self {
        Self {
            processor,
            interval,
            batch_size,
        }
    }

    pub async fn run_once(&self) -> Result<usize> {
        Ok(self.processor.process_due(self.batch_size).await?.len())
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(10)));

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) if count > 0 => {
                        tracing::debug!("Webhook sweeper handled {} deliveries", count);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Webhook sweep failed: {}", e);
                    }
                }
            }
        })
    }
}
