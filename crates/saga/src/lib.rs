//! Saga orchestration for trading-account money movements.
//!
//! Every multi-step operation (deposit, withdrawal, temporary capital, bulk
//! account deletion) is a saga whose progress is persisted as execution info.
//! Handlers are driven by at-least-once, possibly reordered message delivery,
//! so each one follows the same law:
//!
//! 1. Load the execution info for the operation id.
//! 2. If its state is behind the expected one, fail so the message is
//!    redelivered later.
//! 3. If it is ahead, drop the message.
//! 4. Otherwise move to the next state, send the next command and save.
//!
//! The ledger applies each operation id at most once per account, which makes
//! resending a command after a lost save harmless.

pub mod accounts;
pub mod balance;
pub mod bus;
pub mod context;
pub mod delete_accounts;
pub mod deposit;
pub mod dispatcher;
pub mod error;
mod funds;
pub mod messages;
pub mod state;
pub mod temporary_capital;
pub mod trading_engine;
pub mod withdrawal;
pub mod worker;

pub use accounts::{
    AccountsService, CreateAccount, DeleteAccountsRequest, FundsRequest,
    GiveTemporaryCapitalRequest, ManualChargeRequest, RevokeTemporaryCapitalRequest,
};
pub use bus::{DeadLetter, Delivery, InMemoryMessageBus, MessageBus};
pub use context::SagaContext;
pub use delete_accounts::{DeleteAccountsData, DeleteAccountsOutcome, DeleteAccountsState};
pub use deposit::{DepositData, DepositState};
pub use dispatcher::Dispatcher;
pub use error::{Result, SagaError};
pub use funds::FundsOperationData;
pub use messages::{ChangeSource, Command, Event, Message, TemporaryCapitalKind};
pub use state::{SagaData, ensure_state, switch_state};
pub use temporary_capital::{TemporaryCapitalData, TemporaryCapitalState};
pub use trading_engine::{BlockOutcome, InMemoryTradingEngine, TradingEngine, TradingEngineError};
pub use withdrawal::{WithdrawalData, WithdrawalState};
pub use worker::{DrainReport, MessagePump, Outcome, RetryPolicy};
