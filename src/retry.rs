//! The one retry policy shared by webhook processing, refunds and the outbox.

use crate::config::WebhookSettings;
use crate::error::{AppError, ErrorClass, Result};
use crate::observability::get_metrics;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff parameterized by error classification: transient
/// errors are retried up to `max_attempts`, permanent ones never.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&WebhookSettings> for RetryPolicy {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1:
    /// base, 2×base, 4×base, … capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decides after `attempt` attempts have failed with `error`.
    pub fn decide(&self, error: &AppError, attempt: u32) -> RetryDecision {
        match error.classify() {
            ErrorClass::Permanent => RetryDecision::GiveUp,
            ErrorClass::Transient if attempt >= self.max_attempts => RetryDecision::GiveUp,
            ErrorClass::Transient => RetryDecision::RetryAfter(self.delay_for(attempt)),
        }
    }

    /// Runs `operation` in-line until it succeeds, fails permanently, or
    /// exhausts the attempt budget. The closure receives the attempt number.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => match self.decide(&e, attempt) {
                    RetryDecision::GiveUp => return Err(e),
                    RetryDecision::RetryAfter(delay) => {
                        get_metrics().record_retry(operation_name);
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&AppError::UnknownReference("PAY-1".into()), 1),
            RetryDecision::GiveUp
        );
        let timeout = AppError::LockTimeout {
            resource: "account:1".into(),
            waited_ms: 1,
        };
        assert_eq!(
            policy.decide(&timeout, 1),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(policy.decide(&timeout, 4), RetryDecision::GiveUp);
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AppError::CoordinationUnavailable("blip".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_at_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(2)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::ConflictInProgress("k".into())) }
            })
            .await;

        assert!(matches!(result, Err(AppError::ConflictInProgress(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
