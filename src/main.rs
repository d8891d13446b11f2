use credit_settlement::api::{create_router, AppState};
use credit_settlement::config::Settings;
use credit_settlement::engine::{EngineConfig, EnginePorts, SettlementEngine};
use credit_settlement::observability::{
    init_logging, init_metrics, HealthChecker, HealthProbe, KafkaProbe, LogConfig, PostgresProbe,
    RedisProbe,
};
use credit_settlement::outbox::{KafkaNotificationSink, LoggingNotificationSink, NotificationSink};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const LOCK_KEY_PREFIX: &str = "credit_settlement:lock";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::from_settings(&settings.application));
    let metrics_handle = init_metrics()?;
    info!("Configuration loaded");

    // Connect to PostgreSQL
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    // Redis backs the per-user locks. A dead Redis fails requests, not startup.
    let redis_client = redis::Client::open(settings.redis.url.as_str())?;

    let (sink, kafka_client): (Arc<dyn NotificationSink>, _) = if settings.kafka.enabled {
        match KafkaNotificationSink::connect(&settings.kafka.brokers, settings.kafka.topic_prefix.clone()).await {
            Ok(sink) => {
                let client = sink.client();
                info!(brokers = %settings.kafka.brokers, "Kafka notification sink connected");
                (Arc::new(sink), Some(client))
            }
            Err(e) => {
                warn!(error = %e, "Kafka unavailable, outbox will retry through the logging sink");
                (Arc::new(LoggingNotificationSink), None)
            }
        }
    } else {
        (Arc::new(LoggingNotificationSink), None)
    };

    let ports = EnginePorts::postgres(pool.clone(), redis_client.clone(), LOCK_KEY_PREFIX);
    let engine = Arc::new(SettlementEngine::new(ports, EngineConfig::from_settings(&settings))?);

    let mut probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(PostgresProbe::new(pool.clone())),
        Arc::new(RedisProbe::new(redis_client)),
    ];
    if settings.kafka.enabled {
        probes.push(Arc::new(KafkaProbe::new(kafka_client)));
    }
    let health_checker = Arc::new(HealthChecker::new(probes));

    let jobs = engine.spawn_background_jobs(&settings, sink);
    info!(count = jobs.len(), "Background jobs started");

    let state = AppState::new(engine)
        .with_metrics(metrics_handle)
        .with_health_checker(health_checker);
    let app = create_router(state);

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Credit settlement engine listening");

    axum::serve(listener, app).await?;

    for job in jobs {
        job.abort();
    }

    Ok(())
}
