use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::storage::{
    IdempotencyRecord, IdempotencyScope, IdempotencyStatus, IdempotencyStore, ReserveOutcome,
};
use crate::observability::get_metrics;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Counters for guard decisions, kept alongside the Prometheus series so
/// tests and the admin surface can read them directly.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_checks: AtomicU64,
    pub reservations: AtomicU64,
    pub replays: AtomicU64,
    pub in_progress_conflicts: AtomicU64,
    pub completed: AtomicU64,
    pub released: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            in_progress_conflicts: self.in_progress_conflicts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_checks: u64,
    pub reservations: u64,
    pub replays: u64,
    pub in_progress_conflicts: u64,
    pub completed: u64,
    pub released: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.replays as f64 / self.total_checks as f64
        }
    }
}

/// Proof that the caller owns `(key, scope)` until it completes or releases it.
#[derive(Debug, Clone)]
pub struct ReservationToken {
    pub key: String,
    pub scope: IdempotencyScope,
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Result of `check_and_reserve`.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The operation already completed; this is its stored result.
    Cached(serde_json::Value),
    /// No prior completion; the caller must perform the operation.
    Reserved(ReservationToken),
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuardConfig {
    pub webhook_ttl_seconds: i64,
    pub api_ttl_seconds: i64,
    pub reservation_ttl_seconds: i64,
    pub conflict_retry_attempts: u32,
    pub conflict_retry_delay: std::time::Duration,
}

impl Default for IdempotencyGuardConfig {
    fn default() -> Self {
        Self::from(&IdempotencySettings::default())
    }
}

impl From<&IdempotencySettings> for IdempotencyGuardConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            webhook_ttl_seconds: settings.webhook_ttl_seconds,
            api_ttl_seconds: settings.api_ttl_seconds,
            reservation_ttl_seconds: settings.reservation_ttl_seconds,
            conflict_retry_attempts: settings.conflict_retry_attempts,
            conflict_retry_delay: std::time::Duration::from_millis(settings.conflict_retry_delay_ms),
        }
    }
}

impl IdempotencyGuardConfig {
    fn ttl_for(&self, scope: IdempotencyScope) -> Duration {
        match scope {
            IdempotencyScope::Webhook => Duration::seconds(self.webhook_ttl_seconds),
            IdempotencyScope::Api => Duration::seconds(self.api_ttl_seconds),
        }
    }
}

/// Deduplicates webhook events and client request keys.
///
/// A key is either completed (its result is replayed), reserved by exactly
/// one worker, or absent. Store failures propagate: the guard never lets an
/// operation run without a reservation.
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyGuardConfig,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyGuardConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Returns the cached result for a completed key, or reserves it.
    ///
    /// A key reserved by another worker is retried a bounded number of times,
    /// then surfaces as `ConflictInProgress` (retryable). Reusing a key with a
    /// different request fingerprint is an `IdempotencyConflict`.
    pub async fn check_and_reserve(
        &self,
        key: &str,
        scope: IdempotencyScope,
        request_hash: &str,
    ) -> Result<Reservation> {
        self.metrics.total_checks.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let record = IdempotencyRecord::reservation(
                key,
                scope,
                request_hash,
                self.config.reservation_ttl_seconds,
            );

            let outcome = match self.store.try_reserve(&record).await {
                Err(AppError::ConflictInProgress(_)) => None,
                other => Some(other?),
            };

            match outcome {
                Some(ReserveOutcome::Reserved(reserved)) => {
                    self.metrics.reservations.fetch_add(1, Ordering::Relaxed);
                    get_metrics().record_idempotency_check(scope.as_str(), "reserved");
                    tracing::debug!(key = %key, scope = scope.as_str(), "Idempotency key reserved");
                    return Ok(Reservation::Reserved(ReservationToken {
                        key: reserved.key,
                        scope,
                        owner: reserved.owner,
                        expires_at: reserved.expires_at,
                    }));
                }
                Some(ReserveOutcome::Existing(existing)) => {
                    if existing.request_hash != request_hash {
                        get_metrics().record_idempotency_check(scope.as_str(), "conflict");
                        return Err(AppError::IdempotencyConflict(key.to_string()));
                    }

                    if existing.status == IdempotencyStatus::Completed {
                        self.metrics.replays.fetch_add(1, Ordering::Relaxed);
                        get_metrics().record_idempotency_check(scope.as_str(), "replayed");
                        let snapshot = existing.result_snapshot.ok_or_else(|| {
                            AppError::Internal(anyhow::anyhow!(
                                "Completed idempotency record '{}' has no result",
                                key
                            ))
                        })?;
                        return Ok(Reservation::Cached(snapshot));
                    }
                }
                None => {}
            }

            self.metrics.in_progress_conflicts.fetch_add(1, Ordering::Relaxed);
            if attempt >= self.config.conflict_retry_attempts.max(1) {
                get_metrics().record_idempotency_check(scope.as_str(), "in_progress");
                tracing::debug!(key = %key, attempts = attempt, "Idempotency key still in progress");
                return Err(AppError::ConflictInProgress(key.to_string()));
            }
            tokio::time::sleep(self.config.conflict_retry_delay).await;
        }
    }

    /// Stores `result` for replay and extends the record to the scope TTL.
    pub async fn complete<T: Serialize>(&self, token: &ReservationToken, result: &T) -> Result<()> {
        let snapshot = serde_json::to_value(result).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to serialize result: {}", e))
        })?;
        let expires_at = Utc::now() + self.config.ttl_for(token.scope);

        let stored = self
            .store
            .complete(&token.key, token.scope, token.owner, snapshot, expires_at)
            .await?;
        if !stored {
            tracing::warn!(key = %token.key, "Reservation lapsed before completion was recorded");
        }
        self.metrics.completed.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Gives the key back so a later attempt can retry the operation.
    pub async fn release(&self, token: &ReservationToken) -> Result<()> {
        self.store.release(&token.key, token.scope, token.owner).await?;
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Runs `operation` at most once per key: replays the stored result for a
    /// completed key, otherwise reserves, runs, and records the outcome. A
    /// failed operation releases its reservation.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        scope: IdempotencyScope,
        request_hash: &str,
        operation: F,
    ) -> Result<Replayable<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = match self.check_and_reserve(key, scope, request_hash).await? {
            Reservation::Cached(snapshot) => {
                let value = serde_json::from_value(snapshot).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("Failed to deserialize cached result: {}", e))
                })?;
                return Ok(Replayable::Replayed(value));
            }
            Reservation::Reserved(token) => token,
        };

        match operation().await {
            Ok(value) => {
                if let Err(e) = self.complete(&token, &value).await {
                    // The effect is committed; a later replay re-runs the
                    // operation and the ledger's own dedupe absorbs it.
                    tracing::error!(key = %key, error = %e, "Failed to record idempotent result");
                }
                Ok(Replayable::Fresh(value))
            }
            Err(e) => {
                if let Err(release_err) = self.release(&token).await {
                    tracing::error!(key = %key, error = %release_err, "Failed to release idempotency key");
                }
                Err(e)
            }
        }
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.store.cleanup_expired(Utc::now()).await
    }
}

/// Value returned by `execute`, tagged with whether it was replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum Replayable<T> {
    Fresh(T),
    Replayed(T),
}

impl<T> Replayable<T> {
    pub fn is_replay(&self) -> bool {
        matches!(self, Replayable::Replayed(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Replayable::Fresh(value) | Replayable::Replayed(value) => value,
        }
    }
}

/// Periodically deletes expired idempotency records.
pub struct IdempotencyCleanupJob {
    guard: Arc<IdempotencyGuard>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(guard: Arc<IdempotencyGuard>, interval_seconds: u64) -> Self {
        Self {
            guard,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.guard.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(self.interval_seconds.max(1)));

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        let snapshot = self.guard.metrics().snapshot();
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                        tracing::debug!(
                            total_checks = snapshot.total_checks,
                            replay_rate = snapshot.replay_rate(),
                            "Idempotency guard stats"
                        );
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::InMemoryIdempotencyStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyGuardConfig {
                conflict_retry_attempts: 2,
                conflict_retry_delay: std::time::Duration::from_millis(1),
                ..IdempotencyGuardConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_completed_key_replays_result() {
        let guard = guard();
        let token = match guard
            .check_and_reserve("evt_1", IdempotencyScope::Webhook, "h")
            .await
            .unwrap()
        {
            Reservation::Reserved(token) => token,
            other => panic!("expected reservation, got {:?}", other),
        };
        guard.complete(&token, &json!({"credited": "20.00"})).await.unwrap();

        match guard
            .check_and_reserve("evt_1", IdempotencyScope::Webhook, "h")
            .await
            .unwrap()
        {
            Reservation::Cached(snapshot) => assert_eq!(snapshot, json!({"credited": "20.00"})),
            other => panic!("expected cached result, got {:?}", other),
        }
        let stats = guard.metrics().snapshot();
        assert_eq!(stats.replays, 1);
        assert_eq!(stats.replay_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_reserved_key_reports_in_progress_after_bounded_retries() {
        let guard = guard();
        guard
            .check_and_reserve("evt_2", IdempotencyScope::Webhook, "h")
            .await
            .unwrap();

        let err = guard
            .check_and_reserve("evt_2", IdempotencyScope::Webhook, "h")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConflictInProgress(_)));
        assert!(err.is_transient());
        assert_eq!(guard.metrics().snapshot().in_progress_conflicts, 2);
    }

    #[tokio::test]
    async fn test_different_payload_is_conflict() {
        let guard = guard();
        guard
            .check_and_reserve("key", IdempotencyScope::Api, "hash-a")
            .await
            .unwrap();

        let err = guard
            .check_and_reserve("key", IdempotencyScope::Api, "hash-b")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_execute_runs_operation_once() {
        let guard = guard();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = guard
                .execute("evt_3", IdempotencyScope::Webhook, "h", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AppError>(42u32)
                })
                .await
                .unwrap();
            assert_eq!(result.into_inner(), 42);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_operation_releases_key() {
        let guard = guard();

        let first = guard
            .execute("evt_4", IdempotencyScope::Webhook, "h", || async {
                Err::<u32, _>(AppError::LockTimeout {
                    resource: "account:x".to_string(),
                    waited_ms: 10,
                })
            })
            .await;
        assert!(first.is_err());

        let second = guard
            .execute("evt_4", IdempotencyScope::Webhook, "h", || async { Ok::<_, AppError>(7u32) })
            .await
            .unwrap();
        assert_eq!(second, Replayable::Fresh(7));
    }
}
