//! Identifier types shared across the account management crates.

pub mod types;

pub use types::{AccountId, ClientId, OperationId};
