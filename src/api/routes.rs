use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::engine::SettlementEngine;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Option<Arc<HealthChecker>>,
}

impl AppState {
    pub fn new(engine: Arc<SettlementEngine>) -> Self {
        Self {
            engine,
            metrics_handle: None,
            health_checker: None,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(checker);
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // Provider webhooks
        .route("/webhooks/payment", post(handlers::receive_payment_webhook))
        .route("/webhooks/dead-letters", get(handlers::list_dead_letters))
        .route("/webhooks/dead-letters/:id/replay", post(handlers::replay_dead_letter))
        // Payment endpoints
        .route("/payments/initialize", post(handlers::initialize_payment))
        // Verification endpoints
        .route("/verifications", post(handlers::purchase_verification))
        .route("/verifications/:id/deliver", post(handlers::confirm_delivery))
        .route("/verifications/:id/refund", post(handlers::refund_verification))
        // Account endpoints
        .route("/accounts/:user_id", post(handlers::open_account))
        .route("/accounts/:user_id/balance", get(handlers::get_balance))
        .route("/accounts/:user_id/transactions", get(handlers::get_transactions))
        .route("/accounts/:user_id/reconciliation", get(handlers::reconcile_account))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
