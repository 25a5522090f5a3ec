//! Trading engine contract and in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::{AccountId, OperationId};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors returned by the trading engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradingEngineError {
    /// The engine refused the request. Final for the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The engine could not be reached. The request may be retried.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl TradingEngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingEngineError::Unavailable(_))
    }
}

/// Result of a block request. Accounts not listed were blocked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub failed_account_ids: BTreeMap<AccountId, String>,
}

/// Operations the account engine asks of the trading engine.
///
/// Every call is keyed by operation id and must be idempotent for it.
#[async_trait]
pub trait TradingEngine: Send + Sync {
    /// Holds `amount` of the account's margin for a pending withdrawal.
    async fn freeze_amount_for_withdrawal(
        &self,
        operation_id: &OperationId,
        account_id: &AccountId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), TradingEngineError>;

    /// Releases the margin held by a withdrawal that did not go through.
    async fn unfreeze_margin_on_fail_withdrawal(
        &self,
        operation_id: &OperationId,
        account_id: &AccountId,
        amount: Decimal,
    ) -> Result<(), TradingEngineError>;

    /// Stops trading and withdrawals on accounts about to be deleted.
    async fn block_accounts_for_deletion(
        &self,
        operation_id: &OperationId,
        account_ids: &[AccountId],
    ) -> Result<BlockOutcome, TradingEngineError>;

    /// Drops deleted accounts and unblocks the ones that could not be deleted.
    async fn finish_accounts_deletion(
        &self,
        operation_id: &OperationId,
        deleted_account_ids: &[AccountId],
        failed_account_ids: &[AccountId],
    ) -> Result<(), TradingEngineError>;
}

#[derive(Debug, Default)]
struct InMemoryTradingEngineState {
    frozen: HashMap<(AccountId, OperationId), Decimal>,
    blocked: BTreeSet<AccountId>,
    removed: BTreeSet<AccountId>,
    cannot_block: BTreeMap<AccountId, String>,
    reject_freeze: Option<String>,
    unavailable: bool,
    freeze_calls: usize,
}

/// In-memory trading engine for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTradingEngine {
    state: Arc<Mutex<InMemoryTradingEngineState>>,
}

impl InMemoryTradingEngine {
    /// Creates a new in-memory trading engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every freeze with `reason` until cleared with `None`.
    pub async fn set_reject_freeze(&self, reason: Option<&str>) {
        self.state.lock().await.reject_freeze = reason.map(str::to_string);
    }

    /// Makes every call fail as unavailable while `unavailable` is set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Makes blocking `account_id` fail with `reason`.
    pub async fn refuse_block(&self, account_id: AccountId, reason: &str) {
        self.state
            .lock()
            .await
            .cannot_block
            .insert(account_id, reason.to_string());
    }

    /// Total margin currently held on the account.
    pub async fn frozen_amount(&self, account_id: &AccountId) -> Decimal {
        self.state
            .lock()
            .await
            .frozen
            .iter()
            .filter(|((account, _), _)| account == account_id)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub async fn is_blocked(&self, account_id: &AccountId) -> bool {
        self.state.lock().await.blocked.contains(account_id)
    }

    pub async fn is_removed(&self, account_id: &AccountId) -> bool {
        self.state.lock().await.removed.contains(account_id)
    }

    /// Number of freeze requests received, including repeats.
    pub async fn freeze_calls(&self) -> usize {
        self.state.lock().await.freeze_calls
    }
}

fn ensure_available(state: &InMemoryTradingEngineState) -> Result<(), TradingEngineError> {
    if state.unavailable {
        return Err(TradingEngineError::Unavailable(
            "trading engine is not responding".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl TradingEngine for InMemoryTradingEngine {
    async fn freeze_amount_for_withdrawal(
        &self,
        operation_id: &OperationId,
        account_id: &AccountId,
        amount: Decimal,
        _reason: &str,
    ) -> Result<(), TradingEngineError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.freeze_calls += 1;

        if let Some(ref reason) = state.reject_freeze {
            return Err(TradingEngineError::Rejected(reason.clone()));
        }
        state
            .frozen
            .entry((account_id.clone(), operation_id.clone()))
            .or_insert(amount);
        Ok(())
    }

    async fn unfreeze_margin_on_fail_withdrawal(
        &self,
        operation_id: &OperationId,
        account_id: &AccountId,
        _amount: Decimal,
    ) -> Result<(), TradingEngineError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state
            .frozen
            .remove(&(account_id.clone(), operation_id.clone()));
        Ok(())
    }

    async fn block_accounts_for_deletion(
        &self,
        _operation_id: &OperationId,
        account_ids: &[AccountId],
    ) -> Result<BlockOutcome, TradingEngineError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;

        let mut outcome = BlockOutcome::default();
        for account_id in account_ids {
            let refused = state.cannot_block.get(account_id).cloned();
            match refused {
                Some(reason) => {
                    outcome
                        .failed_account_ids
                        .insert(account_id.clone(), reason);
                }
                None => {
                    state.blocked.insert(account_id.clone());
                }
            }
        }
        Ok(outcome)
    }

    async fn finish_accounts_deletion(
        &self,
        _operation_id: &OperationId,
        deleted_account_ids: &[AccountId],
        failed_account_ids: &[AccountId],
    ) -> Result<(), TradingEngineError> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;

        for account_id in deleted_account_ids {
            state.blocked.remove(account_id);
            state.removed.insert(account_id.clone());
        }
        for account_id in failed_account_ids {
            state.blocked.remove(account_id);
        }
        Ok(())
    }
}
