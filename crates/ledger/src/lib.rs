//! Trading account ledger.
//!
//! Holds account rows (balance, withdraw-transfer limit, flags, temporary
//! capital) and the append-only log of balance changes. The central
//! primitive is [`AccountsRepository::update_balance`]: it runs under an
//! exclusive lock on the account row and applies each operation id at most
//! once, so message redelivery never double-charges an account.

pub mod account;
pub mod balance_change;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use account::{
    Account, AccountFilter, AccountFlags, DEFAULT_RECENT_OPERATIONS_CAPACITY, RecentOperations,
    TemporaryCapital,
};
pub use balance_change::{AccountBalanceChange, AccountBalanceChangeReasonType, BalanceChangeQuery};
pub use common::{AccountId, ClientId, OperationId};
pub use error::{LedgerError, Result};
pub use memory::InMemoryAccountsRepository;
pub use postgres::PostgresAccountsRepository;
pub use repository::{AccountsRepository, BalanceUpdate, BalanceUpdateOutcome, LedgerSettings};
