pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{
    AggregatedHealth, DependencyHealth, HealthChecker, HealthProbe, HealthStatus, KafkaProbe,
    PostgresProbe, RedisProbe,
};
pub use logging::{
    init_logging, mask_amount, mask_sensitive, mask_uuid, raise_operator_alert, LogConfig,
    LogFormat,
};
pub use metrics::{get_metrics, init_metrics, LatencyTimer, Metrics, METRICS};
