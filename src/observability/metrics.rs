use crate::error::{AppError, Result};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the settlement engine.
///
/// Calls are cheap no-ops until a recorder is installed, so services record
/// unconditionally and tests never need `init_metrics`.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_ledger_commit(&self, transaction_type: &str) {
        counter!("settlement_ledger_commits_total", "type" => transaction_type.to_string()).increment(1);
    }

    pub fn record_ledger_rejection(&self, transaction_type: &str, reason: &str) {
        counter!("settlement_ledger_rejections_total", "type" => transaction_type.to_string(), "reason" => reason.to_string()).increment(1);
    }

    pub fn record_ledger_commit_latency(&self, duration_ms: f64) {
        histogram!("settlement_ledger_commit_duration_ms").record(duration_ms);
    }

    pub fn record_idempotency_check(&self, scope: &str, outcome: &str) {
        counter!("settlement_idempotency_checks_total", "scope" => scope.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_lock_acquired(&self, wait_ms: f64) {
        counter!("settlement_lock_grants_total").increment(1);
        histogram!("settlement_lock_wait_duration_ms").record(wait_ms);
    }

    pub fn record_lock_timeout(&self) {
        counter!("settlement_lock_timeouts_total").increment(1);
    }

    pub fn record_webhook_received(&self, outcome: &str) {
        counter!("settlement_webhooks_received_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_webhook_processed(&self, outcome: &str) {
        counter!("settlement_webhooks_processed_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_webhook_dead_lettered(&self, reason: &str) {
        counter!("settlement_webhooks_dead_lettered_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn record_retry(&self, operation: &str) {
        counter!("settlement_retries_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_refund(&self, outcome: &str) {
        counter!("settlement_refunds_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_outbox_delivery(&self, topic: &str, success: bool) {
        counter!("settlement_outbox_deliveries_total", "topic" => topic.to_string(), "success" => success.to_string()).increment(1);
    }

    pub fn record_operator_alert(&self, kind: &str) {
        counter!("settlement_operator_alerts_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder (once) and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    let handle = METRICS_HANDLE.get_or_init(|| handle).clone();
    METRICS.get_or_init(Metrics::new);

    Ok(handle)
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("settlement_ledger_commits_total", Unit::Count, "Ledger units of work committed, by transaction type");
    describe_counter!("settlement_ledger_rejections_total", Unit::Count, "Ledger adjustments rejected, by reason");
    describe_histogram!("settlement_ledger_commit_duration_ms", Unit::Milliseconds, "Ledger commit latency in milliseconds");

    describe_counter!("settlement_idempotency_checks_total", Unit::Count, "Idempotency guard decisions, by scope and outcome");

    describe_counter!("settlement_lock_grants_total", Unit::Count, "Per-user locks granted");
    describe_counter!("settlement_lock_timeouts_total", Unit::Count, "Lock acquisitions that timed out");
    describe_histogram!("settlement_lock_wait_duration_ms", Unit::Milliseconds, "Time spent waiting for a per-user lock");

    describe_counter!("settlement_webhooks_received_total", Unit::Count, "Inbound webhooks, by acceptance outcome");
    describe_counter!("settlement_webhooks_processed_total", Unit::Count, "Webhook processing attempts, by outcome");
    describe_counter!("settlement_webhooks_dead_lettered_total", Unit::Count, "Webhooks moved to the dead-letter state");
    describe_counter!("settlement_retries_total", Unit::Count, "Retries scheduled by the shared retry policy");

    describe_counter!("settlement_refunds_total", Unit::Count, "Refund orchestrations, by outcome");
    describe_counter!("settlement_outbox_deliveries_total", Unit::Count, "Outbox delivery attempts");
    describe_counter!("settlement_operator_alerts_total", Unit::Count, "Conditions that need an operator");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
