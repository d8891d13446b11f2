use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use http::{header, HeaderMap, StatusCode};
use uuid::Uuid;

use crate::api::requests::{
    InitializePaymentRequest, ListDeadLettersQuery, PurchaseVerificationRequest,
    RefundVerificationRequest, ValidationError, IDEMPOTENCY_KEY_HEADER,
};
use crate::api::responses::{
    ApiResponse, BalanceResponse, DeliveryResponse, ErrorResponse, TransactionResponse,
    ValidationErrorDetail, WebhookAckResponse,
};
use crate::error::AppError;
use crate::observability::AggregatedHealth;
use crate::services::{
    DeliveryOutcome, InitializePayment, PaymentInitialized, PurchaseReceipt, PurchaseRequest,
    ReconciliationReport, RefundOutcome,
};
use crate::webhook::{ProcessingResult, SIGNATURE_HEADER};

use super::routes::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

/// Maps an error to its HTTP status. Transient coordination and storage
/// failures are 503 so callers retry; nothing was applied.
pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::Validation(_) | AppError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        AppError::SignatureInvalid => StatusCode::UNAUTHORIZED,
        AppError::NotFound(_) | AppError::UnknownReference(_) => StatusCode::NOT_FOUND,
        AppError::IdempotencyConflict(_) | AppError::ConflictInProgress(_) => StatusCode::CONFLICT,
        AppError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::LockTimeout { .. }
        | AppError::VersionConflict { .. }
        | AppError::StaleFencingToken { .. }
        | AppError::CoordinationUnavailable(_)
        | AppError::Database(_)
        | AppError::Redis(_)
        | AppError::Kafka(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::InvariantViolation(_) | AppError::Config(_) | AppError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: AppError) -> ApiError {
    let status = status_for(&error);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(code = error.code(), "Request failed: {}", error);
        "An internal error occurred".to_string()
    } else {
        tracing::debug!(code = error.code(), "Request rejected: {}", error);
        error.to_string()
    };

    (
        status,
        Json(ApiResponse::<()>::error(ErrorResponse::new(error.code(), message))),
    )
}

fn validation_response(errors: Vec<ValidationError>) -> ApiError {
    let details: Vec<ValidationErrorDetail> = errors
        .into_iter()
        .map(|e| ValidationErrorDetail {
            field: e.field,
            message: e.message,
        })
        .collect();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed").with_details(details),
        )),
    )
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Aggregated dependency health.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<AggregatedHealth>>, ApiError> {
    match &state.health_checker {
        Some(checker) => Ok(Json(ApiResponse::success(checker.check_all().await))),
        None => Err(error_response(AppError::NotFound(
            "health checks are not configured".to_string(),
        ))),
    }
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    match &state.health_checker {
        Some(checker) if !checker.is_ready().await => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::new(),
        ),
    }
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Provider payment webhook. Acknowledges once the delivery is durably
/// recorded; the ledger is updated asynchronously.
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookAckResponse>>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let accepted = state
        .engine
        .webhooks
        .accept(&body, signature)
        .await
        .map_err(error_response)?;

    let processor = state.engine.webhooks.clone();
    let delivery_id = accepted.delivery_id;
    tokio::spawn(async move {
        if let Err(e) = processor.process_delivery(delivery_id).await {
            // Left pending; the sweeper retries it once the lease expires.
            tracing::error!(delivery_id = %delivery_id, error = %e, "Webhook processing failed");
        }
    });

    Ok(Json(ApiResponse::success(WebhookAckResponse {
        delivery_id: accepted.delivery_id,
        event_id: accepted.event_id,
        status: "accepted".to_string(),
    })))
}

/// List dead-lettered deliveries awaiting manual reconciliation.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListDeadLettersQuery>,
) -> Result<Json<ApiResponse<Vec<DeliveryResponse>>>, ApiError> {
    let dead = state
        .engine
        .webhooks
        .list_dead_letters(query.limit.clamp(1, 500))
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(
        dead.into_iter().map(DeliveryResponse::from).collect(),
    )))
}

/// Re-drive a dead-lettered delivery.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ProcessingResult>>, ApiError> {
    let result = state
        .engine
        .webhooks
        .replay_dead_letter(id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(result)))
}

// ============================================================================
// Payment Handlers
// ============================================================================

/// Initialize a payment. `201` on first use of the key, `200` when replayed.
pub async fn initialize_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitializePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentInitialized>>), ApiError> {
    let Some(key) = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(error_response(AppError::Validation(
            "Idempotency-Key header is required".to_string(),
        )));
    };
    request.validate().map_err(validation_response)?;

    let result = state
        .engine
        .payments
        .initialize_payment(
            key,
            InitializePayment {
                user_id: request.user_id,
                amount: request.amount,
            },
        )
        .await
        .map_err(error_response)?;

    let status = if result.is_replay() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(result.into_inner()))))
}

// ============================================================================
// Verification Handlers
// ============================================================================

/// Purchase a verification.
pub async fn purchase_verification(
    State(state): State<AppState>,
    Json(request): Json<PurchaseVerificationRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PurchaseReceipt>>), ApiError> {
    request.validate().map_err(validation_response)?;

    let receipt = state
        .engine
        .verifications
        .purchase(PurchaseRequest {
            verification_id: request.verification_id,
            user_id: request.user_id,
            amount: request.amount,
        })
        .await
        .map_err(error_response)?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(receipt))))
}

/// Provisioning succeeded for a verification.
pub async fn confirm_delivery(
    State(state): State<AppState>,
    Path(verification_id): Path<String>,
) -> Result<Json<ApiResponse<DeliveryOutcome>>, ApiError> {
    let outcome = state
        .engine
        .verifications
        .confirm_delivery(&verification_id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(outcome)))
}

/// Refund a verification's debit.
pub async fn refund_verification(
    State(state): State<AppState>,
    Path(verification_id): Path<String>,
    Json(request): Json<RefundVerificationRequest>,
) -> Result<Json<ApiResponse<RefundOutcome>>, ApiError> {
    let outcome = state
        .engine
        .refunds
        .refund(&verification_id, request.reason)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(outcome)))
}

// ============================================================================
// Account Handlers
// ============================================================================

/// Open the account for a new user. Repeat calls return the existing account.
pub async fn open_account(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<BalanceResponse>>, ApiError> {
    let account = state
        .engine
        .ledger
        .open_account(user_id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(BalanceResponse::from(account))))
}

/// Get account balance.
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<BalanceResponse>>, ApiError> {
    let account = state
        .engine
        .ledger
        .account(user_id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(BalanceResponse::from(account))))
}

/// Get the account's transaction log, oldest first.
pub async fn get_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<TransactionResponse>>>, ApiError> {
    let transactions = state
        .engine
        .ledger
        .transactions(user_id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(
        transactions.into_iter().map(TransactionResponse::from).collect(),
    )))
}

/// Check `balance == Σ transactions` for the account.
pub async fn reconcile_account(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ReconciliationReport>>, ApiError> {
    let report = state
        .engine
        .ledger
        .reconcile(user_id)
        .await
        .map_err(error_response)?;

    Ok(Json(ApiResponse::success(report)))
}
