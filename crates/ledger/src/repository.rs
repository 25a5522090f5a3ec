//! Accounts repository contract.

use async_trait::async_trait;
use common::{AccountId, OperationId};
use rust_decimal::Decimal;

use crate::account::{
    Account, AccountFilter, AccountFlags, DEFAULT_RECENT_OPERATIONS_CAPACITY, TemporaryCapital,
};
use crate::balance_change::{
    AccountBalanceChange, AccountBalanceChangeReasonType, BalanceChangeQuery,
};
use crate::Result;

/// Tunables shared by repository implementations.
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    /// How many operation ids each account remembers for deduplication.
    pub recent_operations_capacity: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            recent_operations_capacity: DEFAULT_RECENT_OPERATIONS_CAPACITY,
        }
    }
}

/// A request to change an account's balance by a signed delta.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub operation_id: OperationId,
    pub account_id: AccountId,
    pub amount_delta: Decimal,
    /// Also move the withdraw-transfer limit by `amount_delta`.
    pub change_limit: bool,
    pub reason_type: AccountBalanceChangeReasonType,
    pub event_source_id: String,
    pub comment: String,
    pub audit_log: String,
}

impl BalanceUpdate {
    pub fn new(
        operation_id: OperationId,
        account_id: AccountId,
        amount_delta: Decimal,
        reason_type: AccountBalanceChangeReasonType,
    ) -> Self {
        Self {
            operation_id,
            account_id,
            amount_delta,
            change_limit: false,
            reason_type,
            event_source_id: String::new(),
            comment: String::new(),
            audit_log: String::new(),
        }
    }

    pub fn change_limit(mut self, change_limit: bool) -> Self {
        self.change_limit = change_limit;
        self
    }

    pub fn event_source_id(mut self, event_source_id: impl Into<String>) -> Self {
        self.event_source_id = event_source_id.into();
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn audit_log(mut self, audit_log: impl Into<String>) -> Self {
        self.audit_log = audit_log.into();
        self
    }
}

/// Result of [`AccountsRepository::update_balance`].
#[derive(Debug, Clone)]
pub struct BalanceUpdateOutcome {
    /// Account snapshot after the call.
    pub account: Account,

    /// The log entry for this operation id. On a replay this is the entry
    /// written by the first application.
    pub change: Option<AccountBalanceChange>,

    /// False if the operation had already been applied and nothing changed.
    pub applied: bool,
}

/// Storage of account rows and their balance change log.
///
/// Every mutation runs under an exclusive lock on the single account row it
/// touches. No operation ever locks more than one account.
#[async_trait]
pub trait AccountsRepository: Send + Sync {
    /// Inserts a new account. Fails with `DuplicateAccount` if the id exists.
    async fn add(&self, account: Account) -> Result<()>;

    /// Loads an account by id.
    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>>;

    /// Lists accounts matching `filter`, ordered by id.
    async fn get_all(&self, filter: &AccountFilter) -> Result<Vec<Account>>;

    /// Applies a balance delta exactly once per operation id.
    ///
    /// Under the row lock: if the operation id was already applied the
    /// current account is returned unchanged; otherwise the id is recorded,
    /// the delta is added to the balance (and the withdraw-transfer limit if
    /// requested), and one [`AccountBalanceChange`] is appended.
    ///
    /// A `Withdraw` or `TemporaryCashAdjustment` debit that would take the
    /// balance below zero fails with `InsufficientBalance`, and so does every
    /// replay of it.
    async fn update_balance(&self, update: BalanceUpdate) -> Result<BalanceUpdateOutcome>;

    /// Adds or removes a temporary capital entry by id.
    async fn update_temporary_capital(
        &self,
        account_id: &AccountId,
        item: TemporaryCapital,
        add: bool,
    ) -> Result<Account>;

    /// Re-inserts previously removed temporary capital entries that are not
    /// already present.
    async fn rollback_temporary_capital(
        &self,
        account_id: &AccountId,
        items: &[TemporaryCapital],
    ) -> Result<Account>;

    /// Changes the disabled / withdrawal-disabled flags.
    async fn update_flags(&self, account_id: &AccountId, flags: AccountFlags) -> Result<Account>;

    /// Marks an account as deleted. The row is kept.
    async fn mark_as_deleted(&self, account_id: &AccountId) -> Result<Account>;

    /// Reads the balance change log of one account, oldest first.
    async fn get_balance_changes(
        &self,
        query: &BalanceChangeQuery,
    ) -> Result<Vec<AccountBalanceChange>>;
}
