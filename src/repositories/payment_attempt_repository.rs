use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{PaymentAttempt, PaymentState, StateTransition};
use crate::repositories::ports::PaymentAttemptStore;

const ATTEMPT_COLUMNS: &str = "id, user_id, external_reference, idempotency_key, amount, state, state_transitions, created_at, updated_at";

#[derive(Debug, FromRow)]
struct PaymentAttemptRow {
    id: Uuid,
    user_id: Uuid,
    external_reference: String,
    idempotency_key: String,
    amount: Decimal,
    state: PaymentState,
    state_transitions: Json<Vec<StateTransition>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PaymentAttemptRow> for PaymentAttempt {
    fn from(row: PaymentAttemptRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            external_reference: row.external_reference,
            idempotency_key: row.idempotency_key,
            amount: row.amount,
            state: row.state,
            state_transitions: row.state_transitions.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for payment attempts.
pub struct PostgresPaymentAttemptStore {
    pool: PgPool,
}

impl PostgresPaymentAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts WHERE {} = $1",
            ATTEMPT_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(PaymentAttempt::from))
    }
}

#[async_trait]
impl PaymentAttemptStore for PostgresPaymentAttemptStore {
    async fn insert(&self, attempt: &PaymentAttempt) -> Result<PaymentAttempt> {
        let inserted = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            r#"
            INSERT INTO payment_attempts (id, user_id, external_reference, idempotency_key, amount, state, state_transitions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt.id)
        .bind(attempt.user_id)
        .bind(&attempt.external_reference)
        .bind(&attempt.idempotency_key)
        .bind(attempt.amount)
        .bind(attempt.state)
        .bind(Json(&attempt.state_transitions))
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        match inserted {
            Some(row) => Ok(row.into()),
            None => self
                .find_by_idempotency_key(&attempt.idempotency_key)
                .await?
                .ok_or_else(|| {
                    AppError::InvariantViolation(format!(
                        "payment attempt for key '{}' conflicted but was not found",
                        attempt.idempotency_key
                    ))
                }),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(PaymentAttempt::from))
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentAttempt>> {
        self.find_one("external_reference", reference).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<PaymentAttempt>> {
        self.find_one("idempotency_key", key).await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: PaymentState,
        transition: StateTransition,
    ) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            r#"
            UPDATE payment_attempts
            SET state = $3,
                state_transitions = state_transitions || $4,
                updated_at = $5
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(id)
        .bind(from)
        .bind(transition.state)
        .bind(Json(vec![transition.clone()]))
        .bind(transition.at)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(PaymentAttempt::from))
    }
}
