use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Funds added by a completed payment.
    Credit,
    /// Funds spent on a verification purchase.
    Debit,
    /// Compensation of a prior verification debit.
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Refund => "refund",
        }
    }
}

/// Immutable audit record of a single balance change.
///
/// `amount` is signed: credits and refunds are positive, debits negative.
/// The account balance always equals the sum of its transaction amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub account_user_id: Uuid,
    pub payment_attempt_id: Option<Uuid>,
    pub verification_id: Option<String>,
    /// Debit this transaction compensates (refunds only).
    pub reverses_transaction_id: Option<Uuid>,
    pub amount: Decimal,
    #[sqlx(rename = "type")]
    pub transaction_type: TransactionType,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Credit caused by a completed payment attempt.
    pub fn credit(user_id: Uuid, payment_attempt_id: Uuid, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_user_id: user_id,
            payment_attempt_id: Some(payment_attempt_id),
            verification_id: None,
            reverses_transaction_id: None,
            amount: amount.abs(),
            transaction_type: TransactionType::Credit,
            created_at: Utc::now(),
        }
    }

    /// Debit for a verification purchase. Stored as a negative amount.
    pub fn debit(user_id: Uuid, verification_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_user_id: user_id,
            payment_attempt_id: None,
            verification_id: Some(verification_id.into()),
            reverses_transaction_id: None,
            amount: -amount.abs(),
            transaction_type: TransactionType::Debit,
            created_at: Utc::now(),
        }
    }

    /// Refund that exactly compensates `debit`.
    pub fn refund_of(debit: &Transaction) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_user_id: debit.account_user_id,
            payment_attempt_id: None,
            verification_id: debit.verification_id.clone(),
            reverses_transaction_id: Some(debit.id),
            amount: debit.amount.abs(),
            transaction_type: TransactionType::Refund,
            created_at: Utc::now(),
        }
    }

    /// Checks that the transaction has exactly one causal parent matching its type.
    pub fn has_valid_parent(&self) -> bool {
        match self.transaction_type {
            TransactionType::Credit => {
                self.payment_attempt_id.is_some() && self.verification_id.is_none()
            }
            TransactionType::Debit => {
                self.verification_id.is_some() && self.payment_attempt_id.is_none()
            }
            TransactionType::Refund => {
                self.verification_id.is_some()
                    && self.payment_attempt_id.is_none()
                    && self.reverses_transaction_id.is_some()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signs_follow_type() {
        let user = Uuid::new_v4();
        let credit = Transaction::credit(user, Uuid::new_v4(), dec!(20.00));
        let debit = Transaction::debit(user, "ver-1", dec!(5.00));
        let refund = Transaction::refund_of(&debit);

        assert_eq!(credit.amount, dec!(20.00));
        assert_eq!(debit.amount, dec!(-5.00));
        assert_eq!(refund.amount, dec!(5.00));
        assert_eq!(credit.amount + debit.amount + refund.amount, dec!(20.00));
    }

    #[test]
    fn test_refund_references_debit() {
        let debit = Transaction::debit(Uuid::new_v4(), "ver-2", dec!(3.50));
        let refund = Transaction::refund_of(&debit);

        assert_eq!(refund.reverses_transaction_id, Some(debit.id));
        assert_eq!(refund.verification_id.as_deref(), Some("ver-2"));
        assert_eq!(refund.account_user_id, debit.account_user_id);
    }

    #[test]
    fn test_causal_parent_validation() {
        let user = Uuid::new_v4();
        assert!(Transaction::credit(user, Uuid::new_v4(), dec!(1)).has_valid_parent());
        assert!(Transaction::debit(user, "v", dec!(1)).has_valid_parent());

        let mut orphan = Transaction::debit(user, "v", dec!(1));
        orphan.verification_id = None;
        assert!(!orphan.has_valid_parent());
    }
}
