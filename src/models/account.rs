use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user's credit balance.
///
/// `version` is the optimistic concurrency counter checked on every ledger
/// commit. `fencing_token` is the highest lock token that has written to this
/// row; commits carrying a lower token are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub user_id: Uuid,
    pub balance: Decimal,
    pub version: i64,
    pub fencing_token: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Creates a new account with a zero balance.
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: Decimal::ZERO,
            version: 0,
            fencing_token: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks if the balance can absorb a signed delta without going negative.
    pub fn can_apply(&self, delta: Decimal) -> bool {
        self.balance + delta >= Decimal::ZERO
    }

    /// Returns true if a writer holding `token` is not older than the last writer.
    pub fn accepts_fencing_token(&self, token: i64) -> bool {
        token >= self.fencing_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_account_is_empty() {
        let account = Account::new(Uuid::new_v4());
        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(account.version, 0);
        assert_eq!(account.fencing_token, 0);
    }

    #[test]
    fn test_can_apply() {
        let mut account = Account::new(Uuid::new_v4());
        account.balance = dec!(10.00);

        assert!(account.can_apply(dec!(-10.00)));
        assert!(account.can_apply(dec!(5.00)));
        assert!(!account.can_apply(dec!(-10.01)));
    }

    #[test]
    fn test_fencing_token_acceptance() {
        let mut account = Account::new(Uuid::new_v4());
        account.fencing_token = 7;

        assert!(account.accepts_fencing_token(7));
        assert!(account.accepts_fencing_token(8));
        assert!(!account.accepts_fencing_token(6));
    }
}
