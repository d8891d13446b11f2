//! Composition root: wires storage and coordination ports into the services.

use crate::config::Settings;
use crate::error::Result;
use crate::idempotency::{
    IdempotencyCleanupJob, IdempotencyGuard, IdempotencyGuardConfig, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use crate::lock::{InMemoryLockBackend, LockBackend, LockManager, LockManagerConfig, RedisLockBackend};
use crate::outbox::{NotificationSink, OutboxWorker};
use crate::repositories::{
    InMemoryStore, LedgerStore, OutboxStore, PaymentAttemptStore, PostgresLedgerStore,
    PostgresOutboxStore, PostgresPaymentAttemptStore, PostgresWebhookDeliveryStore,
    WebhookDeliveryStore,
};
use crate::retry::RetryPolicy;
use crate::services::{Ledger, PaymentService, RefundOrchestrator, VerificationService};
use crate::webhook::{SignatureVerifier, WebhookProcessor, WebhookRetryJob};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Tunables the services need, independent of where they came from.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub webhook_secret: String,
    pub retry: RetryPolicy,
    pub locks: LockManagerConfig,
    pub idempotency: IdempotencyGuardConfig,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            webhook_secret: settings.webhook.secret.clone(),
            retry: RetryPolicy::from(&settings.webhook),
            locks: LockManagerConfig::from(&settings.lock),
            idempotency: IdempotencyGuardConfig::from(&settings.idempotency),
        }
    }

    /// Short delays and timeouts for tests and local runs.
    pub fn for_tests(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            retry: RetryPolicy::new(3, Duration::from_millis(2), Duration::from_millis(10)),
            locks: LockManagerConfig {
                ttl: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(1),
            },
            idempotency: IdempotencyGuardConfig {
                conflict_retry_attempts: 50,
                conflict_retry_delay: Duration::from_millis(2),
                ..IdempotencyGuardConfig::default()
            },
        }
    }
}

/// The storage and coordination backends the engine runs on.
#[derive(Clone)]
pub struct EnginePorts {
    pub ledger: Arc<dyn LedgerStore>,
    pub attempts: Arc<dyn PaymentAttemptStore>,
    pub deliveries: Arc<dyn WebhookDeliveryStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub lock_backend: Arc<dyn LockBackend>,
}

impl EnginePorts {
    /// PostgreSQL for durable state, Redis for locks.
    pub fn postgres(pool: PgPool, redis_client: redis::Client, lock_prefix: &str) -> Self {
        Self {
            ledger: Arc::new(PostgresLedgerStore::new(pool.clone())),
            attempts: Arc::new(PostgresPaymentAttemptStore::new(pool.clone())),
            deliveries: Arc::new(PostgresWebhookDeliveryStore::new(pool.clone())),
            outbox: Arc::new(PostgresOutboxStore::new(pool.clone())),
            idempotency: Arc::new(PostgresIdempotencyStore::new(pool)),
            lock_backend: Arc::new(RedisLockBackend::new(redis_client, lock_prefix)),
        }
    }
}

/// Handles on the in-memory backends, for fault injection and inspection.
#[derive(Clone, Default)]
pub struct InMemoryBackends {
    pub store: Arc<InMemoryStore>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub locks: Arc<InMemoryLockBackend>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&self) -> EnginePorts {
        EnginePorts {
            ledger: self.store.clone(),
            attempts: self.store.clone(),
            deliveries: self.store.clone(),
            outbox: self.store.clone(),
            idempotency: self.idempotency.clone(),
            lock_backend: self.locks.clone(),
        }
    }
}

/// Every service of the settlement core, sharing one set of ports.
pub struct SettlementEngine {
    pub ledger: Arc<Ledger>,
    pub locks: Arc<LockManager>,
    pub guard: Arc<IdempotencyGuard>,
    pub payments: Arc<PaymentService>,
    pub verifications: Arc<VerificationService>,
    pub refunds: Arc<RefundOrchestrator>,
    pub webhooks: Arc<WebhookProcessor>,
    pub outbox: Arc<dyn OutboxStore>,
    pub retry: RetryPolicy,
}

impl SettlementEngine {
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Result<Self> {
        let ledger = Arc::new(Ledger::new(ports.ledger));
        let locks = Arc::new(LockManager::new(ports.lock_backend, config.locks));
        let guard = Arc::new(IdempotencyGuard::new(ports.idempotency, config.idempotency));

        let payments = Arc::new(PaymentService::new(
            ports.attempts,
            ledger.clone(),
            locks.clone(),
            guard.clone(),
        ));
        let verifications = Arc::new(VerificationService::new(ledger.clone(), locks.clone()));
        let refunds = Arc::new(RefundOrchestrator::new(
            ledger.clone(),
            locks.clone(),
            config.retry.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(
            SignatureVerifier::new(&config.webhook_secret)?,
            ports.deliveries,
            payments.clone(),
            guard.clone(),
            config.retry.clone(),
        ));

        Ok(Self {
            ledger,
            locks,
            guard,
            payments,
            verifications,
            refunds,
            webhooks,
            outbox: ports.outbox,
            retry: config.retry,
        })
    }

    /// Engine on fresh in-memory backends, returned alongside them.
    pub fn in_memory(config: EngineConfig) -> Result<(Self, InMemoryBackends)> {
        let backends = InMemoryBackends::new();
        let engine = Self::new(backends.ports(), config)?;
        Ok((engine, backends))
    }

    /// Spawns the idempotency cleanup, webhook sweeper and outbox worker.
    pub fn spawn_background_jobs(
        &self,
        settings: &Settings,
        sink: Arc<dyn NotificationSink>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            IdempotencyCleanupJob::new(
                self.guard.clone(),
                settings.idempotency.cleanup_interval_seconds,
            )
            .start(),
            WebhookRetryJob::new(
                self.webhooks.clone(),
                Duration::from_millis(settings.webhook.sweep_interval_ms),
                settings.outbox.batch_size,
            )
            .start(),
            OutboxWorker::new(self.outbox.clone(), sink, &settings.outbox, self.retry.clone()).start(),
        ]
    }
}
