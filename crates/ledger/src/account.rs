//! Account rows and their in-row sub-ledgers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use common::{AccountId, ClientId, OperationId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::balance_change::AccountBalanceChange;
use crate::repository::BalanceUpdate;
use crate::{LedgerError, Result};

/// Default number of operation ids remembered per account.
pub const DEFAULT_RECENT_OPERATIONS_CAPACITY: usize = 200;

/// A reversible capital injection, identified by the id of the event that
/// granted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryCapital {
    pub id: String,
    pub amount: Decimal,
}

impl TemporaryCapital {
    pub fn new(id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            id: id.into(),
            amount,
        }
    }
}

/// Bounded FIFO of the operation ids most recently applied to an account.
///
/// Once full, recording a new id evicts the oldest one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentOperations(VecDeque<OperationId>);

impl RecentOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, operation_id: &OperationId) -> bool {
        self.0.contains(operation_id)
    }

    /// Appends `operation_id`, evicting the oldest entries beyond `capacity`.
    pub fn record(&mut self, operation_id: OperationId, capacity: usize) {
        self.0.push_back(operation_id);
        while self.0.len() > capacity.max(1) {
            self.0.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationId> {
        self.0.iter()
    }
}

/// Flag changes applied by an account update. `None` leaves the flag as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFlags {
    pub is_disabled: Option<bool>,
    pub is_withdrawal_disabled: Option<bool>,
}

/// Trading account ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub client_id: ClientId,
    pub trading_condition_id: String,
    pub base_asset_id: String,
    pub balance: Decimal,
    pub withdraw_transfer_limit: Decimal,
    pub legal_entity: String,
    pub is_disabled: bool,
    pub is_withdrawal_disabled: bool,
    pub is_deleted: bool,
    pub modification_timestamp: DateTime<Utc>,
    pub temporary_capital: Vec<TemporaryCapital>,
    pub last_executed_operations: RecentOperations,
}

impl Account {
    /// Creates an enabled account with zero balance.
    pub fn new(
        id: AccountId,
        client_id: ClientId,
        trading_condition_id: impl Into<String>,
        base_asset_id: impl Into<String>,
        legal_entity: impl Into<String>,
    ) -> Self {
        Self {
            id,
            client_id,
            trading_condition_id: trading_condition_id.into(),
            base_asset_id: base_asset_id.into(),
            balance: Decimal::ZERO,
            withdraw_transfer_limit: Decimal::ZERO,
            legal_entity: legal_entity.into(),
            is_disabled: false,
            is_withdrawal_disabled: false,
            is_deleted: false,
            modification_timestamp: Utc::now(),
            temporary_capital: Vec::new(),
            last_executed_operations: RecentOperations::new(),
        }
    }

    /// Returns true if `operation_id` is among the operations recently
    /// decided on this account, applied or refused.
    pub fn has_executed(&self, operation_id: &OperationId) -> bool {
        self.last_executed_operations.contains(operation_id)
    }

    /// Decides whether `update` may be applied. Callers rule out an already
    /// applied operation first.
    ///
    /// A debit whose reason requires cover is refused if it would take the
    /// balance below zero. The refused operation id is recorded, so a replay
    /// is refused as well even if the balance has grown since.
    pub fn admit_balance_update(
        &mut self,
        update: &BalanceUpdate,
        recent_operations_capacity: usize,
    ) -> Result<()> {
        let refused_before = self.has_executed(&update.operation_id);
        let uncovered = update.amount_delta < Decimal::ZERO
            && update.reason_type.requires_covered_debit()
            && self.balance + update.amount_delta < Decimal::ZERO;
        if !refused_before && !uncovered {
            return Ok(());
        }

        if !refused_before {
            self.last_executed_operations
                .record(update.operation_id.clone(), recent_operations_capacity);
        }
        Err(LedgerError::InsufficientBalance {
            account_id: self.id.clone(),
            balance: self.balance,
            amount_delta: update.amount_delta,
        })
    }

    /// Sum of all temporary capital entries.
    pub fn total_temporary_capital(&self) -> Decimal {
        self.temporary_capital.iter().map(|item| item.amount).sum()
    }

    /// Finds a temporary capital entry by id.
    pub fn find_temporary_capital(&self, id: &str) -> Option<&TemporaryCapital> {
        self.temporary_capital.iter().find(|item| item.id == id)
    }

    /// Applies a balance update and returns the log entry describing it.
    ///
    /// Does not check for duplicates; callers check [`Account::has_executed`]
    /// under the row lock first.
    pub fn apply_balance_update(
        &mut self,
        update: &BalanceUpdate,
        recent_operations_capacity: usize,
        now: DateTime<Utc>,
    ) -> AccountBalanceChange {
        self.balance += update.amount_delta;
        if update.change_limit {
            self.withdraw_transfer_limit += update.amount_delta;
        }
        self.last_executed_operations
            .record(update.operation_id.clone(), recent_operations_capacity);
        self.modification_timestamp = now;

        AccountBalanceChange {
            id: update.operation_id.clone(),
            account_id: self.id.clone(),
            client_id: self.client_id.clone(),
            change_timestamp: now,
            change_amount: update.amount_delta,
            balance: self.balance,
            withdraw_transfer_limit: self.withdraw_transfer_limit,
            comment: update.comment.clone(),
            reason_type: update.reason_type,
            event_source_id: update.event_source_id.clone(),
            legal_entity: self.legal_entity.clone(),
            audit_log: update.audit_log.clone(),
        }
    }

    /// Adds (`add == true`) or removes a temporary capital entry by id.
    ///
    /// Adding an id that is already present and removing an id that is absent
    /// are both no-ops, so replays are harmless.
    pub fn apply_temporary_capital(&mut self, item: TemporaryCapital, add: bool) {
        if add {
            if self.find_temporary_capital(&item.id).is_none() {
                self.temporary_capital.push(item);
            }
        } else {
            self.temporary_capital.retain(|existing| existing.id != item.id);
        }
    }

    /// Re-inserts previously removed entries that are not present.
    pub fn restore_temporary_capital(&mut self, items: &[TemporaryCapital]) {
        for item in items {
            self.apply_temporary_capital(item.clone(), true);
        }
    }

    /// Applies flag changes.
    pub fn apply_flags(&mut self, flags: AccountFlags) {
        if let Some(is_disabled) = flags.is_disabled {
            self.is_disabled = is_disabled;
        }
        if let Some(is_withdrawal_disabled) = flags.is_withdrawal_disabled {
            self.is_withdrawal_disabled = is_withdrawal_disabled;
        }
    }
}

/// Filter for listing accounts.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    pub client_id: Option<ClientId>,
    pub include_deleted: bool,
}

impl AccountFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accounts of this client.
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Also return accounts marked as deleted.
    pub fn include_deleted(mut self, include_deleted: bool) -> Self {
        self.include_deleted = include_deleted;
        self
    }

    pub fn matches(&self, account: &Account) -> bool {
        if account.is_deleted && !self.include_deleted {
            return false;
        }
        if let Some(ref client_id) = self.client_id
            && &account.client_id != client_id
        {
            return false;
        }
        true
    }
}
