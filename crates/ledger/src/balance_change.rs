//! Append-only balance change log entries.

use chrono::{DateTime, Utc};
use common::{AccountId, ClientId, OperationId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Why a balance changed. Closed set used for reporting and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountBalanceChangeReasonType {
    Deposit,
    Withdraw,
    PositionClosed,
    Reset,
    Swap,
    Manual,
    UnrealizedDailyPnL,
    RealizedPnL,
    Commission,
    Dividend,
    OnBehalf,
    Tax,
    TemporaryCashAdjustment,
    CompensationPayments,
    Create,
}

impl AccountBalanceChangeReasonType {
    /// Debits with these reasons must be covered by the balance.
    pub fn requires_covered_debit(self) -> bool {
        matches!(self, Self::Withdraw | Self::TemporaryCashAdjustment)
    }

    /// All reason types, in declaration order.
    pub const ALL: [AccountBalanceChangeReasonType; 15] = [
        Self::Deposit,
        Self::Withdraw,
        Self::PositionClosed,
        Self::Reset,
        Self::Swap,
        Self::Manual,
        Self::UnrealizedDailyPnL,
        Self::RealizedPnL,
        Self::Commission,
        Self::Dividend,
        Self::OnBehalf,
        Self::Tax,
        Self::TemporaryCashAdjustment,
        Self::CompensationPayments,
        Self::Create,
    ];

    /// Returns the reason type name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "Deposit",
            Self::Withdraw => "Withdraw",
            Self::PositionClosed => "PositionClosed",
            Self::Reset => "Reset",
            Self::Swap => "Swap",
            Self::Manual => "Manual",
            Self::UnrealizedDailyPnL => "UnrealizedDailyPnL",
            Self::RealizedPnL => "RealizedPnL",
            Self::Commission => "Commission",
            Self::Dividend => "Dividend",
            Self::OnBehalf => "OnBehalf",
            Self::Tax => "Tax",
            Self::TemporaryCashAdjustment => "TemporaryCashAdjustment",
            Self::CompensationPayments => "CompensationPayments",
            Self::Create => "Create",
        }
    }
}

impl std::fmt::Display for AccountBalanceChangeReasonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccountBalanceChangeReasonType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidData(format!("unknown reason type '{s}'")))
    }
}

/// Immutable ledger entry appended on every accepted balance mutation.
///
/// `id` is the operation id that caused the change; it is unique per account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalanceChange {
    pub id: OperationId,
    pub account_id: AccountId,
    pub client_id: ClientId,
    pub change_timestamp: DateTime<Utc>,
    /// Signed delta applied to the balance.
    pub change_amount: Decimal,
    /// Balance after the change.
    pub balance: Decimal,
    /// Withdraw-transfer limit after the change.
    pub withdraw_transfer_limit: Decimal,
    pub comment: String,
    pub reason_type: AccountBalanceChangeReasonType,
    pub event_source_id: String,
    pub legal_entity: String,
    pub audit_log: String,
}

/// Filter for reading the balance change log of one account.
#[derive(Debug, Clone)]
pub struct BalanceChangeQuery {
    pub account_id: AccountId,

    /// Changes at or after this timestamp.
    pub from: Option<DateTime<Utc>>,

    /// Changes strictly before this timestamp.
    pub to: Option<DateTime<Utc>>,

    /// Restrict to these reason types.
    pub reason_types: Option<Vec<AccountBalanceChangeReasonType>>,
}

impl BalanceChangeQuery {
    /// Creates a query over the whole history of an account.
    pub fn for_account(account_id: AccountId) -> Self {
        Self {
            account_id,
            from: None,
            to: None,
            reason_types: None,
        }
    }

    /// Only changes at or after `from`.
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Only changes strictly before `to`.
    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    /// Only changes with one of the given reasons.
    pub fn reason_types(mut self, reason_types: Vec<AccountBalanceChangeReasonType>) -> Self {
        self.reason_types = Some(reason_types);
        self
    }

    /// Returns true if `change` passes the filter.
    pub fn matches(&self, change: &AccountBalanceChange) -> bool {
        if change.account_id != self.account_id {
            return false;
        }
        if let Some(from) = self.from
            && change.change_timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to
            && change.change_timestamp >= to
        {
            return false;
        }
        if let Some(ref reasons) = self.reason_types
            && !reasons.contains(&change.reason_type)
        {
            return false;
        }
        true
    }
}
