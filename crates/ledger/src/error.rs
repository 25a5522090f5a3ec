//! Ledger error types.

use common::AccountId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No account row exists for the id.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// An account with the same id (or the same client/asset/trading-condition
    /// combination) already exists.
    #[error("Duplicate account: {0}")]
    DuplicateAccount(String),

    /// A debit the balance does not cover was refused.
    #[error("Insufficient balance on account {account_id}: {balance} available, change of {amount_delta} refused")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Decimal,
        amount_delta: Decimal,
    },

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Returns true if the failure is infrastructural and the call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
