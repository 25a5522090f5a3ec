//! Commands and events exchanged over the message bus.
//!
//! Commands are point-to-point requests handled by exactly one handler.
//! Events are facts published to any number of subscribers. Both carry the
//! operation id that scopes idempotency for the saga they belong to.

use std::collections::BTreeMap;

use common::{AccountId, ClientId, OperationId};
use ledger::{Account, AccountBalanceChange, AccountBalanceChangeReasonType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which flow a balance change was made for. Sagas match ledger outcomes
/// on this and the operation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSource {
    Deposit,
    Withdrawal,
    ManualCharge,
    GiveTemporaryCapital,
    RevokeTemporaryCapital,
}

/// What happened to the account in an [`AccountChanged`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountChangeType {
    Created,
    Updated,
    BalanceUpdated,
    Deleted,
}

/// Direction of a temporary capital operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemporaryCapitalKind {
    Give,
    Revoke,
}

impl TemporaryCapitalKind {
    /// Execution-info operation name for this kind.
    pub fn operation_name(&self) -> &'static str {
        match self {
            TemporaryCapitalKind::Give => "GiveTemporaryCapital",
            TemporaryCapitalKind::Revoke => "RevokeTemporaryCapital",
        }
    }

    /// Balance change source for this kind.
    pub fn source(&self) -> ChangeSource {
        match self {
            TemporaryCapitalKind::Give => ChangeSource::GiveTemporaryCapital,
            TemporaryCapitalKind::Revoke => ChangeSource::RevokeTemporaryCapital,
        }
    }
}

/// Reference to an operation, for messages that carry nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation_id: OperationId,
}

impl OperationRef {
    pub fn new(operation_id: OperationId) -> Self {
        Self { operation_id }
    }
}

/// Starts a deposit or a withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeginFundsOperation {
    pub operation_id: OperationId,
    pub client_id: ClientId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub comment: String,
    pub audit_log: String,
}

/// Margin hold request sent to the trading engine, or its release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginHold {
    pub operation_id: OperationId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub reason: String,
}

/// Applies a balance delta through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBalanceInternal {
    pub operation_id: OperationId,
    pub account_id: AccountId,
    pub amount_delta: Decimal,
    pub change_limit: bool,
    pub reason_type: AccountBalanceChangeReasonType,
    pub source: ChangeSource,
    pub event_source_id: String,
    pub comment: String,
    pub audit_log: String,
}

/// Starts giving or revoking temporary capital.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTemporaryCapital {
    pub kind: TemporaryCapitalKind,
    pub operation_id: OperationId,
    pub account_id: AccountId,
    /// Entry to give, or entry to revoke. `None` revokes every entry.
    pub event_source_id: Option<String>,
    /// Amount to give. Ignored when revoking.
    pub amount: Decimal,
    pub reason: String,
    pub comment: String,
    pub audit_log: String,
}

/// Reference to a temporary capital operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryCapitalRef {
    pub kind: TemporaryCapitalKind,
    pub operation_id: OperationId,
}

/// Starts deleting a batch of accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAccounts {
    pub operation_id: OperationId,
    pub account_ids: Vec<AccountId>,
    pub comment: String,
}

/// Asks the trading engine to block accounts ahead of deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAccounts {
    pub operation_id: OperationId,
    pub account_ids: Vec<AccountId>,
}

/// Commands handled by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    BeginDeposit(BeginFundsOperation),
    FreezeAmountForDeposit(OperationRef),
    CompleteDeposit(OperationRef),
    FailDeposit(OperationRef),

    BeginWithdrawal(BeginFundsOperation),
    FreezeAmountForWithdrawal(MarginHold),
    UnfreezeMarginOnFailWithdrawal(MarginHold),
    CompleteWithdrawal(OperationRef),
    FailWithdrawal(OperationRef),

    UpdateBalanceInternal(UpdateBalanceInternal),

    StartTemporaryCapital(StartTemporaryCapital),
    FinishTemporaryCapital(TemporaryCapitalRef),

    DeleteAccounts(DeleteAccounts),
    BlockAccountsForDeletion(BlockAccounts),
    MarkAccountsAsDeleted(OperationRef),
    FinishAccountsDeletion(OperationRef),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::BeginDeposit(_) => "BeginDeposit",
            Command::FreezeAmountForDeposit(_) => "FreezeAmountForDeposit",
            Command::CompleteDeposit(_) => "CompleteDeposit",
            Command::FailDeposit(_) => "FailDeposit",
            Command::BeginWithdrawal(_) => "BeginWithdrawal",
            Command::FreezeAmountForWithdrawal(_) => "FreezeAmountForWithdrawal",
            Command::UnfreezeMarginOnFailWithdrawal(_) => "UnfreezeMarginOnFailWithdrawal",
            Command::CompleteWithdrawal(_) => "CompleteWithdrawal",
            Command::FailWithdrawal(_) => "FailWithdrawal",
            Command::UpdateBalanceInternal(_) => "UpdateBalanceInternal",
            Command::StartTemporaryCapital(_) => "StartTemporaryCapital",
            Command::FinishTemporaryCapital(_) => "FinishTemporaryCapital",
            Command::DeleteAccounts(_) => "DeleteAccounts",
            Command::BlockAccountsForDeletion(_) => "BlockAccountsForDeletion",
            Command::MarkAccountsAsDeleted(_) => "MarkAccountsAsDeleted",
            Command::FinishAccountsDeletion(_) => "FinishAccountsDeletion",
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        match self {
            Command::BeginDeposit(c) | Command::BeginWithdrawal(c) => &c.operation_id,
            Command::FreezeAmountForDeposit(c)
            | Command::CompleteDeposit(c)
            | Command::FailDeposit(c)
            | Command::CompleteWithdrawal(c)
            | Command::FailWithdrawal(c)
            | Command::MarkAccountsAsDeleted(c)
            | Command::FinishAccountsDeletion(c) => &c.operation_id,
            Command::FreezeAmountForWithdrawal(c) | Command::UnfreezeMarginOnFailWithdrawal(c) => {
                &c.operation_id
            }
            Command::UpdateBalanceInternal(c) => &c.operation_id,
            Command::StartTemporaryCapital(c) => &c.operation_id,
            Command::FinishTemporaryCapital(c) => &c.operation_id,
            Command::DeleteAccounts(c) => &c.operation_id,
            Command::BlockAccountsForDeletion(c) => &c.operation_id,
        }
    }
}

/// An operation failed with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailed {
    pub operation_id: OperationId,
    pub reason: String,
}

/// Terminal success of a deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsOperationSucceeded {
    pub operation_id: OperationId,
    pub client_id: ClientId,
    pub account_id: AccountId,
    pub amount: Decimal,
}

/// Published after every ledger mutation made by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountChanged {
    pub operation_id: OperationId,
    pub account: Account,
    pub event_type: AccountChangeType,
    pub balance_change: Option<AccountBalanceChange>,
    pub source: Option<ChangeSource>,
}

/// The ledger refused a balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalanceChangeFailed {
    pub operation_id: OperationId,
    pub account_id: AccountId,
    pub source: ChangeSource,
    pub reason: String,
}

/// A temporary capital operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryCapitalFailed {
    pub kind: TemporaryCapitalKind,
    pub operation_id: OperationId,
    pub reason: String,
}

/// The trading engine blocked the requested accounts, except those listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsBlockedForDeletion {
    pub operation_id: OperationId,
    pub failed_account_ids: BTreeMap<AccountId, String>,
}

/// Accounts were marked deleted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsMarkedAsDeleted {
    pub operation_id: OperationId,
    pub deleted_account_ids: Vec<AccountId>,
}

/// Terminal outcome of a delete-accounts operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsDeletionFinished {
    pub operation_id: OperationId,
    pub deleted_account_ids: Vec<AccountId>,
    pub failed_account_ids: BTreeMap<AccountId, String>,
}

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    DepositStarted(OperationRef),
    DepositStartFailed(OperationFailed),
    AmountForDepositFrozen(OperationRef),
    DepositSucceeded(FundsOperationSucceeded),
    DepositFailed(OperationFailed),

    WithdrawalStarted(OperationRef),
    WithdrawalStartFailed(OperationFailed),
    AmountForWithdrawalFrozen(OperationRef),
    AmountForWithdrawalFreezeFailed(OperationFailed),
    UnfreezeMarginOnFailSucceeded(OperationRef),
    WithdrawalSucceeded(FundsOperationSucceeded),
    WithdrawalFailed(OperationFailed),

    AccountChanged(AccountChanged),
    AccountBalanceChangeFailed(AccountBalanceChangeFailed),

    TemporaryCapitalStarted(TemporaryCapitalRef),
    TemporaryCapitalSucceeded(TemporaryCapitalRef),
    TemporaryCapitalFailed(TemporaryCapitalFailed),

    DeleteAccountsStarted(OperationRef),
    AccountsBlockedForDeletion(AccountsBlockedForDeletion),
    AccountsMarkedAsDeleted(AccountsMarkedAsDeleted),
    AccountsDeletionFinished(AccountsDeletionFinished),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::DepositStarted(_) => "DepositStarted",
            Event::DepositStartFailed(_) => "DepositStartFailed",
            Event::AmountForDepositFrozen(_) => "AmountForDepositFrozen",
            Event::DepositSucceeded(_) => "DepositSucceeded",
            Event::DepositFailed(_) => "DepositFailed",
            Event::WithdrawalStarted(_) => "WithdrawalStarted",
            Event::WithdrawalStartFailed(_) => "WithdrawalStartFailed",
            Event::AmountForWithdrawalFrozen(_) => "AmountForWithdrawalFrozen",
            Event::AmountForWithdrawalFreezeFailed(_) => "AmountForWithdrawalFreezeFailed",
            Event::UnfreezeMarginOnFailSucceeded(_) => "UnfreezeMarginOnFailSucceeded",
            Event::WithdrawalSucceeded(_) => "WithdrawalSucceeded",
            Event::WithdrawalFailed(_) => "WithdrawalFailed",
            Event::AccountChanged(_) => "AccountChanged",
            Event::AccountBalanceChangeFailed(_) => "AccountBalanceChangeFailed",
            Event::TemporaryCapitalStarted(_) => "TemporaryCapitalStarted",
            Event::TemporaryCapitalSucceeded(_) => "TemporaryCapitalSucceeded",
            Event::TemporaryCapitalFailed(_) => "TemporaryCapitalFailed",
            Event::DeleteAccountsStarted(_) => "DeleteAccountsStarted",
            Event::AccountsBlockedForDeletion(_) => "AccountsBlockedForDeletion",
            Event::AccountsMarkedAsDeleted(_) => "AccountsMarkedAsDeleted",
            Event::AccountsDeletionFinished(_) => "AccountsDeletionFinished",
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        match self {
            Event::DepositStarted(e)
            | Event::AmountForDepositFrozen(e)
            | Event::WithdrawalStarted(e)
            | Event::AmountForWithdrawalFrozen(e)
            | Event::UnfreezeMarginOnFailSucceeded(e)
            | Event::DeleteAccountsStarted(e) => &e.operation_id,
            Event::DepositStartFailed(e)
            | Event::DepositFailed(e)
            | Event::WithdrawalStartFailed(e)
            | Event::AmountForWithdrawalFreezeFailed(e)
            | Event::WithdrawalFailed(e) => &e.operation_id,
            Event::DepositSucceeded(e) | Event::WithdrawalSucceeded(e) => &e.operation_id,
            Event::AccountChanged(e) => &e.operation_id,
            Event::AccountBalanceChangeFailed(e) => &e.operation_id,
            Event::TemporaryCapitalStarted(e) | Event::TemporaryCapitalSucceeded(e) => {
                &e.operation_id
            }
            Event::TemporaryCapitalFailed(e) => &e.operation_id,
            Event::AccountsBlockedForDeletion(e) => &e.operation_id,
            Event::AccountsMarkedAsDeleted(e) => &e.operation_id,
            Event::AccountsDeletionFinished(e) => &e.operation_id,
        }
    }
}

/// Anything that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum Message {
    Command(Command),
    Event(Event),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Command(command) => command.name(),
            Message::Event(event) => event.name(),
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        match self {
            Message::Command(command) => command.operation_id(),
            Message::Event(event) => event.operation_id(),
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}
