use crate::config::OutboxSettings;
use crate::error::Result;
use crate::observability::{get_metrics, raise_operator_alert};
use crate::outbox::sink::NotificationSink;
use crate::repositories::OutboxStore;
use crate::retry::RetryPolicy;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Claimed messages stay invisible to other workers for this long.
const CLAIM_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxRunReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

/// Delivers committed outbox messages to the sink at-least-once.
///
/// A message is marked delivered only after the sink accepted it; failures
/// back off with the shared retry policy until `max_attempts`, after which
/// the message is parked as failed and an operator alert is raised.
pub struct OutboxWorker {
    store: Arc<dyn OutboxStore>,
    sink: Arc<dyn NotificationSink>,
    backoff: RetryPolicy,
    batch_size: i64,
    max_attempts: i32,
    poll_interval: Duration,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sink: Arc<dyn NotificationSink>,
        settings: &OutboxSettings,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            store,
            sink,
            backoff,
            batch_size: settings.batch_size.max(1),
            max_attempts: settings.max_attempts.max(1),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }

    pub async fn run_once(&self) -> Result<OutboxRunReport> {
        let messages = self
            .store
            .claim_due(Utc::now(), CLAIM_LEASE, self.batch_size)
            .await?;
        let mut report = OutboxRunReport::default();

        for message in messages {
            match self.sink.publish(&message).await {
                Ok(()) => {
                    self.store.mark_delivered(message.id).await?;
                    get_metrics().record_outbox_delivery(&message.topic, true);
                    report.delivered += 1;
                }
                Err(e) => {
                    get_metrics().record_outbox_delivery(&message.topic, false);
                    let attempts = message.attempts + 1;
                    let error = e.to_string();

                    if attempts >= self.max_attempts {
                        self.store.mark_failed(message.id, attempts, &error).await?;
                        raise_operator_alert(
                            "outbox_delivery_failed",
                            &format!(
                                "message {} ({}) undeliverable to {} after {} attempts: {}",
                                message.id,
                                message.topic,
                                self.sink.name(),
                                attempts,
                                error
                            ),
                        );
                        report.failed += 1;
                    } else {
                        let delay = self.backoff.delay_for(attempts.max(1) as u32);
                        let next_attempt_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        self.store
                            .reschedule(message.id, attempts, next_attempt_at, &error)
                            .await?;
                        tracing::warn!(
                            message_id = %message.id,
                            topic = %message.topic,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Notification delivery failed, rescheduled"
                        );
                        report.rescheduled += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(report) if report.delivered + report.rescheduled + report.failed > 0 => {
                        tracing::debug!(
                            delivered = report.delivered,
                            rescheduled = report.rescheduled,
                            failed = report.failed,
                            "Outbox batch handled"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Outbox run failed: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::models::{OutboxMessage, OutboxStatus, Transaction};
    use crate::outbox::sink::MockNotificationSink;
    use crate::repositories::{InMemoryStore, LedgerStore, UnitOfWork};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    async fn store_with_message() -> (Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let user_id = Uuid::new_v4();
        store.open_account(user_id).await.unwrap();

        let transaction = Transaction::credit(user_id, Uuid::new_v4(), dec!(20.00));
        store
            .commit(UnitOfWork {
                user_id,
                delta: transaction.amount,
                expected_version: 0,
                fencing_token: 1,
                transaction,
                payment_completion: None,
                verification: None,
                notification: Some(OutboxMessage::new(user_id, "payment.credited", json!({"amount": "20.00"}))),
            })
            .await
            .unwrap();

        (store, user_id)
    }

    fn settings(max_attempts: i32) -> OutboxSettings {
        OutboxSettings {
            batch_size: 10,
            poll_interval_ms: 10,
            max_attempts,
        }
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy::new(10, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_delivers_and_marks_message() {
        let (store, user_id) = store_with_message().await;
        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .withf(|m| m.topic == "payment.credited")
            .times(1)
            .returning(|_| Ok(()));

        let worker = OutboxWorker::new(store.clone(), Arc::new(sink), &settings(3), no_backoff());
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.delivered, 1);
        let messages = store.find_by_user(user_id).await.unwrap();
        assert_eq!(messages[0].status, OutboxStatus::Delivered);

        // Nothing left to claim.
        assert_eq!(worker.run_once().await.unwrap(), OutboxRunReport::default());
    }

    #[tokio::test]
    async fn test_failures_reschedule_then_park() {
        let (store, user_id) = store_with_message().await;
        let mut sink = MockNotificationSink::new();
        sink.expect_publish()
            .times(2)
            .returning(|_| Err(AppError::CoordinationUnavailable("broker down".into())));
        sink.expect_name().return_const("mock");

        let worker = OutboxWorker::new(store.clone(), Arc::new(sink), &settings(2), no_backoff());

        assert_eq!(worker.run_once().await.unwrap().rescheduled, 1);
        assert_eq!(worker.run_once().await.unwrap().failed, 1);

        let message = &store.find_by_user(user_id).await.unwrap()[0];
        assert_eq!(message.status, OutboxStatus::Failed);
        assert_eq!(message.attempts, 2);
        assert!(message.last_error.is_some());
    }
}
