use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    fn from_latency(name: &str, latency_ms: f64, slow_after_ms: f64) -> Self {
        if latency_ms > slow_after_ms {
            Self {
                name: name.to_string(),
                status: HealthStatus::Degraded,
                latency_ms: Some(latency_ms),
                message: Some("High latency detected".to_string()),
            }
        } else {
            Self::healthy(name, latency_ms)
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// A single dependency check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// The service refuses traffic while a critical dependency is unhealthy.
    fn is_critical(&self) -> bool {
        true
    }

    async fn check(&self) -> DependencyHealth;
}

pub struct PostgresProbe {
    pool: PgPool,
}

impl PostgresProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HealthProbe for PostgresProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> DependencyHealth {
        let start = Instant::now();

        match tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query("SELECT 1").fetch_one(&self.pool),
        )
        .await
        {
            Ok(Ok(_)) => {
                DependencyHealth::from_latency("database", start.elapsed().as_secs_f64() * 1000.0, 100.0)
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("database", format!("Query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("database", "Connection timeout"),
        }
    }
}

/// Redis holds the per-user locks, so it is critical: without it every
/// mutation is refused.
pub struct RedisProbe {
    client: redis::Client,
}

impl RedisProbe {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for RedisProbe {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> DependencyHealth {
        let start = Instant::now();

        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => match tokio::time::timeout(
                Duration::from_secs(5),
                redis::cmd("PING").query_async::<_, ()>(&mut conn),
            )
            .await
            {
                Ok(Ok(_)) => {
                    DependencyHealth::from_latency("redis", start.elapsed().as_secs_f64() * 1000.0, 50.0)
                }
                Ok(Err(e)) => DependencyHealth::unhealthy("redis", format!("PING failed: {}", e)),
                Err(_) => DependencyHealth::unhealthy("redis", "PING timeout"),
            },
            Err(e) => DependencyHealth::unhealthy("redis", format!("Connection failed: {}", e)),
        }
    }
}

/// Kafka only carries outbox notifications; an outage delays them but never
/// blocks settlement.
pub struct KafkaProbe {
    client: Option<Arc<rskafka::client::Client>>,
}

impl KafkaProbe {
    pub fn new(client: Option<Arc<rskafka::client::Client>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for KafkaProbe {
    fn name(&self) -> &str {
        "kafka"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn check(&self) -> DependencyHealth {
        let Some(client) = &self.client else {
            return DependencyHealth::degraded("kafka", "Kafka disabled; notifications are logged");
        };

        let start = Instant::now();
        match tokio::time::timeout(Duration::from_secs(5), client.list_topics()).await {
            Ok(Ok(_)) => DependencyHealth::healthy("kafka", start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) => DependencyHealth::degraded("kafka", format!("Metadata request failed: {}", e)),
            Err(_) => DependencyHealth::degraded("kafka", "Metadata request timeout"),
        }
    }
}

/// Health checker for all dependencies.
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            probes,
            start_time: Instant::now(),
        }
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            dependencies.push(probe.check().await);
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            dependencies,
        )
    }

    /// Liveness check - returns true if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Ready while no critical dependency is unhealthy.
    pub async fn is_ready(&self) -> bool {
        for probe in self.probes.iter().filter(|p| p.is_critical()) {
            if probe.check().await.status.is_unhealthy() {
                return false;
            }
        }
        true
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        health: DependencyHealth,
        critical: bool,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        fn name(&self) -> &str {
            &self.health.name
        }

        fn is_critical(&self) -> bool {
            self.critical
        }

        async fn check(&self) -> DependencyHealth {
            self.health.clone()
        }
    }

    fn probe(health: DependencyHealth, critical: bool) -> Arc<dyn HealthProbe> {
        Arc::new(FixedProbe { health, critical })
    }

    #[test]
    fn test_aggregated_health_status() {
        let health = AggregatedHealth::new(
            "1.0.0".to_string(),
            100,
            vec![DependencyHealth::healthy("db", 1.0), DependencyHealth::degraded("kafka", "off")],
        );
        assert_eq!(health.status, HealthStatus::Degraded);

        let health = AggregatedHealth::new(
            "1.0.0".to_string(),
            100,
            vec![DependencyHealth::healthy("db", 1.0), DependencyHealth::unhealthy("redis", "down")],
        );
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_slow_dependency_is_degraded() {
        assert_eq!(DependencyHealth::from_latency("db", 150.0, 100.0).status, HealthStatus::Degraded);
        assert_eq!(DependencyHealth::from_latency("db", 5.0, 100.0).status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_lock_store_blocks_readiness() {
        let checker = HealthChecker::new(vec![
            probe(DependencyHealth::healthy("database", 1.0), true),
            probe(DependencyHealth::unhealthy("redis", "down"), true),
        ]);
        assert!(!checker.is_ready().await);
    }

    #[tokio::test]
    async fn test_optional_dependency_does_not_block_readiness() {
        let checker = HealthChecker::new(vec![
            probe(DependencyHealth::healthy("database", 1.0), true),
            probe(DependencyHealth::unhealthy("kafka", "down"), false),
        ]);
        assert!(checker.is_ready().await);
        assert_eq!(checker.check_all().await.status, HealthStatus::Unhealthy);
    }
}
