use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Account, PaymentState, Transaction, TransactionType, Verification};
use crate::repositories::ports::{
    CommitOutcome, LedgerStore, TransactionTotals, UnitOfWork, VerificationChange,
};

const ACCOUNT_COLUMNS: &str = "user_id, balance, version, fencing_token, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, account_user_id, payment_attempt_id, verification_id, reverses_transaction_id, amount, type, created_at";
const VERIFICATION_COLUMNS: &str = "verification_id, user_id, debit_transaction_id, amount, status, created_at, updated_at";

/// PostgreSQL ledger: accounts, the append-only transaction log and verification rows.
///
/// `commit` runs the whole unit of work inside one SQL transaction with the
/// account row locked `FOR UPDATE`, so the balance change and its log entry
/// are never visible without each other.
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_duplicate(&self, candidate: &Transaction) -> Result<Option<Transaction>> {
        let row = match candidate.transaction_type {
            TransactionType::Credit => {
                sqlx::query_as::<_, Transaction>(&format!(
                    "SELECT {} FROM transactions WHERE type = 'credit' AND payment_attempt_id = $1",
                    TRANSACTION_COLUMNS
                ))
                .bind(candidate.payment_attempt_id)
                .fetch_optional(&self.pool)
                .await
            }
            TransactionType::Debit | TransactionType::Refund => {
                sqlx::query_as::<_, Transaction>(&format!(
                    "SELECT {} FROM transactions WHERE type = $1 AND verification_id = $2",
                    TRANSACTION_COLUMNS
                ))
                .bind(candidate.transaction_type)
                .bind(&candidate.verification_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(AppError::Database)?;

        Ok(row)
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn open_account(&self, user_id: Uuid) -> Result<Account> {
        let account = Account::new(user_id);
        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, balance, version, fencing_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(account.user_id)
        .bind(account.balance)
        .bind(account.version)
        .bind(account.fencing_token)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        self.find_account(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account '{}' not found", user_id)))
    }

    async fn find_account(&self, user_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE user_id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<CommitOutcome> {
        if unit.delta != unit.transaction.amount {
            return Err(AppError::InvariantViolation(format!(
                "delta {} does not match transaction amount {}",
                unit.delta, unit.transaction.amount
            )));
        }

        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE user_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(unit.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let account = match account {
            Some(account) => account,
            None => return Ok(CommitOutcome::AccountMissing),
        };

        if account.version != unit.expected_version {
            return Ok(CommitOutcome::VersionConflict {
                actual: account.version,
            });
        }
        if !account.accepts_fencing_token(unit.fencing_token) {
            return Ok(CommitOutcome::StaleFence {
                current: account.fencing_token,
            });
        }

        let transaction = &unit.transaction;
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions (id, account_user_id, payment_attempt_id, verification_id, reverses_transaction_id, amount, type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.account_user_id)
        .bind(transaction.payment_attempt_id)
        .bind(&transaction.verification_id)
        .bind(transaction.reverses_transaction_id)
        .bind(transaction.amount)
        .bind(transaction.transaction_type)
        .bind(transaction.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        if inserted.is_none() {
            tx.rollback().await.map_err(AppError::Database)?;
            return match self.find_duplicate(transaction).await? {
                Some(existing) => Ok(CommitOutcome::Duplicate(existing)),
                None => Err(AppError::InvariantViolation(format!(
                    "transaction {} conflicted but no duplicate was found",
                    transaction.id
                ))),
            };
        }

        if !account.can_apply(unit.delta) {
            tx.rollback().await.map_err(AppError::Database)?;
            return Ok(CommitOutcome::InsufficientFunds {
                balance: account.balance,
            });
        }

        let updated = sqlx::query_as::<_, Account>(&format!(
            r#"
            UPDATE accounts
            SET balance = balance + $2,
                version = version + 1,
                fencing_token = $3,
                updated_at = NOW()
            WHERE user_id = $1 AND version = $4 AND fencing_token <= $3
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(unit.user_id)
        .bind(unit.delta)
        .bind(unit.fencing_token)
        .bind(unit.expected_version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?
        .ok_or_else(|| {
            AppError::InvariantViolation(format!(
                "account {} changed while its row was locked",
                unit.user_id
            ))
        })?;

        if let Some(completion) = &unit.payment_completion {
            let result = sqlx::query(
                r#"
                UPDATE payment_attempts
                SET state = $3,
                    state_transitions = state_transitions || $4,
                    updated_at = NOW()
                WHERE id = $1 AND state = $2
                "#,
            )
            .bind(completion.attempt_id)
            .bind(PaymentState::Processing)
            .bind(completion.transition.state)
            .bind(Json(vec![completion.transition.clone()]))
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

            if result.rows_affected() == 0 {
                return Err(AppError::InvariantViolation(format!(
                    "payment attempt {} is not processing",
                    completion.attempt_id
                )));
            }
        }

        match &unit.verification {
            Some(VerificationChange::Open(verification)) => {
                sqlx::query(
                    r#"
                    INSERT INTO verifications (verification_id, user_id, debit_transaction_id, amount, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(&verification.verification_id)
                .bind(verification.user_id)
                .bind(verification.debit_transaction_id)
                .bind(verification.amount)
                .bind(verification.status)
                .bind(verification.created_at)
                .bind(verification.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;
            }
            Some(VerificationChange::MarkRefunded { verification_id }) => {
                let result = sqlx::query(
                    r#"
                    UPDATE verifications
                    SET status = 'refunded', updated_at = NOW()
                    WHERE verification_id = $1 AND status = 'active'
                    "#,
                )
                .bind(verification_id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;

                if result.rows_affected() == 0 {
                    return Err(AppError::InvariantViolation(format!(
                        "verification {} is not active",
                        verification_id
                    )));
                }
            }
            None => {}
        }

        if let Some(message) = &unit.notification {
            sqlx::query(
                r#"
                INSERT INTO outbox_messages (id, user_id, topic, payload, status, attempts, next_attempt_at, last_error, created_at, delivered_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(message.id)
            .bind(message.user_id)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(message.status)
            .bind(message.attempts)
            .bind(message.next_attempt_at)
            .bind(&message.last_error)
            .bind(message.created_at)
            .bind(message.delivered_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(CommitOutcome::Committed {
            account: updated,
            transaction: unit.transaction,
        })
    }

    async fn find_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE account_user_id = $1 ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn transaction_totals(&self, user_id: Uuid) -> Result<TransactionTotals> {
        let row: (Option<Decimal>, i64) = sqlx::query_as(
            "SELECT SUM(amount), COUNT(*) FROM transactions WHERE account_user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(TransactionTotals {
            sum: row.0.unwrap_or(Decimal::ZERO),
            count: row.1,
        })
    }

    async fn find_verification_transaction(
        &self,
        verification_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE verification_id = $1 AND type = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(verification_id)
        .bind(transaction_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn find_verification(&self, verification_id: &str) -> Result<Option<Verification>> {
        let row = sqlx::query_as::<_, Verification>(&format!(
            "SELECT {} FROM verifications WHERE verification_id = $1",
            VERIFICATION_COLUMNS
        ))
        .bind(verification_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn mark_verification_delivered(
        &self,
        verification_id: &str,
    ) -> Result<Option<Verification>> {
        let row = sqlx::query_as::<_, Verification>(&format!(
            r#"
            UPDATE verifications
            SET status = 'delivered', updated_at = NOW()
            WHERE verification_id = $1 AND status = 'active'
            RETURNING {}
            "#,
            VERIFICATION_COLUMNS
        ))
        .bind(verification_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
