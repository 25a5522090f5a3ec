//! Delete-accounts saga.
//!
//! ```text
//! Initiated ──► Started ──► MtCoreAccountsBlocked ──► AccountsMarkedAsDeleted ──► Finished
//! ```
//!
//! Accounts that fail a check at any step are moved into
//! `failed_account_ids` and skipped by every later step; the operation
//! carries on with the rest. The execution info is deleted once the final
//! event is out, so messages that arrive afterwards find no record and are
//! dropped. A [`DeleteAccountsOutcome`] record stays behind; a late
//! `DeleteAccounts` for an operation that has one is dropped as well.

use std::collections::BTreeMap;

use chrono::{NaiveTime, Utc};
use common::{AccountId, OperationId};
use execution_store::OperationExecutionInfo;
use ledger::BalanceChangeQuery;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::messages::{
    AccountChangeType, AccountChanged, AccountsBlockedForDeletion, AccountsDeletionFinished,
    AccountsMarkedAsDeleted, BlockAccounts, Command, DeleteAccounts, Event, OperationRef,
};
use crate::state::{SagaData, ensure_state, record_transition, switch_state};
use crate::trading_engine::TradingEngineError;

pub const OPERATION_NAME: &str = "DeleteAccounts";

/// Record name of [`DeleteAccountsOutcome`].
pub const OUTCOME_NAME: &str = "DeleteAccountsOutcome";

pub const REASON_NOT_FOUND: &str = "account not found";
pub const REASON_ALREADY_DELETED: &str = "account already deleted";
pub const REASON_NON_ZERO_BALANCE: &str = "non-zero balance";
pub const REASON_CHANGED_TODAY: &str = "balance changed during current trading day";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeleteAccountsState {
    Initiated,
    Started,
    MtCoreAccountsBlocked,
    AccountsMarkedAsDeleted,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAccountsData {
    pub account_ids: Vec<AccountId>,
    pub comment: String,
    /// Accounts dropped from the operation, with the first reason recorded.
    pub failed_account_ids: BTreeMap<AccountId, String>,
    pub state: DeleteAccountsState,
}

impl DeleteAccountsData {
    fn new(command: &DeleteAccounts) -> Self {
        Self {
            account_ids: command.account_ids.clone(),
            comment: command.comment.clone(),
            failed_account_ids: BTreeMap::new(),
            state: DeleteAccountsState::Initiated,
        }
    }

    /// Requested accounts that have not failed, in request order.
    pub fn remaining(&self) -> Vec<AccountId> {
        self.account_ids
            .iter()
            .filter(|id| !self.failed_account_ids.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Adds failures. An account already failed keeps its first reason.
    fn add_failures(&mut self, failures: BTreeMap<AccountId, String>) {
        for (account_id, reason) in failures {
            self.failed_account_ids.entry(account_id).or_insert(reason);
        }
    }
}

impl SagaData for DeleteAccountsData {
    type State = DeleteAccountsState;

    fn state(&self) -> DeleteAccountsState {
        self.state
    }

    fn set_state(&mut self, state: DeleteAccountsState) {
        self.state = state;
    }
}

/// What a finished operation did. Written before its execution info is
/// removed and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAccountsOutcome {
    pub deleted_account_ids: Vec<AccountId>,
    pub failed_account_ids: BTreeMap<AccountId, String>,
}

type Info = OperationExecutionInfo<DeleteAccountsData>;

/// Checks which accounts may be deleted; returns the ones that may not.
///
/// `deleted_ok` accepts accounts already marked deleted, which is how a
/// repeated marking step sees the accounts it marked itself.
async fn check_accounts(
    ctx: &SagaContext,
    account_ids: &[AccountId],
    deleted_ok: bool,
) -> Result<BTreeMap<AccountId, String>> {
    let day_start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    let mut failures = BTreeMap::new();

    for account_id in account_ids {
        let reason = match ctx.accounts.get(account_id).await? {
            None => Some(REASON_NOT_FOUND),
            Some(account) if account.is_deleted && !deleted_ok => Some(REASON_ALREADY_DELETED),
            Some(account) if account.balance != Decimal::ZERO => Some(REASON_NON_ZERO_BALANCE),
            Some(_) => {
                let query = BalanceChangeQuery::for_account(account_id.clone()).from(day_start);
                let today = ctx.accounts.get_balance_changes(&query).await?;
                (!today.is_empty()).then_some(REASON_CHANGED_TODAY)
            }
        };
        if let Some(reason) = reason {
            tracing::warn!(%account_id, reason, "account cannot be deleted");
            failures.insert(account_id.clone(), reason.to_string());
        }
    }
    Ok(failures)
}

async fn load(ctx: &SagaContext, operation_id: &OperationId) -> Result<Option<Info>> {
    let info = ctx.executions.get(OPERATION_NAME, operation_id).await?;
    if info.is_none() {
        tracing::debug!(%operation_id, "delete-accounts operation already finished, message dropped");
    }
    Ok(info)
}

/// Handles `DeleteAccounts`: records the operation and runs the first checks.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, accounts = command.account_ids.len()))]
pub async fn start(ctx: &SagaContext, command: &DeleteAccounts) -> Result<()> {
    let (mut info, _) = ctx
        .executions
        .get_or_add(OPERATION_NAME, &command.operation_id, || {
            DeleteAccountsData::new(command)
        })
        .await?;

    // Checked after the insert: `finish` writes the outcome before it
    // deletes the execution info, so a record recreated here is seen.
    if info.data.state == DeleteAccountsState::Initiated
        && ctx
            .executions
            .get_raw(OUTCOME_NAME, &command.operation_id)
            .await?
            .is_some()
    {
        tracing::info!("delete-accounts operation already finished, command dropped");
        record_transition(OPERATION_NAME, false);
        ctx.executions.delete(&info).await?;
        return Ok(());
    }

    match info.data.state {
        DeleteAccountsState::Initiated => {
            let failures = check_accounts(ctx, &info.data.remaining(), false).await?;
            info.data.add_failures(failures);
            switch_state(
                &mut info.data,
                DeleteAccountsState::Initiated,
                DeleteAccountsState::Started,
            )?;
            record_transition(OPERATION_NAME, true);
            ctx.executions.save(&mut info).await?;
        }
        DeleteAccountsState::Started => {}
        _ => {
            record_transition(OPERATION_NAME, false);
            return Ok(());
        }
    }

    ctx.publish(Event::DeleteAccountsStarted(OperationRef::new(
        command.operation_id.clone(),
    )))
    .await
}

pub async fn on_started(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    let Some(info) = load(ctx, operation_id).await? else {
        return Ok(());
    };
    if !ensure_state(&info.data, DeleteAccountsState::Started)? {
        record_transition(OPERATION_NAME, false);
        return Ok(());
    }

    ctx.send(Command::BlockAccountsForDeletion(BlockAccounts {
        operation_id: operation_id.clone(),
        account_ids: info.data.remaining(),
    }))
    .await
}

/// Asks the trading engine to block the accounts.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id))]
pub async fn block_accounts(ctx: &SagaContext, command: &BlockAccounts) -> Result<()> {
    let failed_account_ids = match ctx
        .trading_engine
        .block_accounts_for_deletion(&command.operation_id, &command.account_ids)
        .await
    {
        Ok(outcome) => outcome.failed_account_ids,
        Err(TradingEngineError::Rejected(reason)) => command
            .account_ids
            .iter()
            .map(|id| (id.clone(), reason.clone()))
            .collect(),
        Err(e) => return Err(e.into()),
    };

    ctx.publish(Event::AccountsBlockedForDeletion(AccountsBlockedForDeletion {
        operation_id: command.operation_id.clone(),
        failed_account_ids,
    }))
    .await
}

pub async fn on_blocked(ctx: &SagaContext, event: &AccountsBlockedForDeletion) -> Result<()> {
    let Some(mut info) = load(ctx, &event.operation_id).await? else {
        return Ok(());
    };
    let advanced = switch_state(
        &mut info.data,
        DeleteAccountsState::Started,
        DeleteAccountsState::MtCoreAccountsBlocked,
    )?;
    record_transition(OPERATION_NAME, advanced);
    if !advanced {
        return Ok(());
    }
    info.data.add_failures(event.failed_account_ids.clone());

    ctx.send(Command::MarkAccountsAsDeleted(OperationRef::new(
        event.operation_id.clone(),
    )))
    .await?;
    ctx.executions.save(&mut info).await?;
    Ok(())
}

/// Re-checks the blocked accounts and marks the rest deleted in the ledger.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id))]
pub async fn mark_as_deleted(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    let operation_id = &command.operation_id;
    let Some(mut info) = load(ctx, operation_id).await? else {
        return Ok(());
    };

    if ensure_state(&info.data, DeleteAccountsState::MtCoreAccountsBlocked)? {
        let failures = check_accounts(ctx, &info.data.remaining(), true).await?;
        info.data.add_failures(failures);

        for account_id in info.data.remaining() {
            let account = ctx.accounts.mark_as_deleted(&account_id).await?;
            ctx.publish(Event::AccountChanged(AccountChanged {
                operation_id: operation_id.clone(),
                account,
                event_type: AccountChangeType::Deleted,
                balance_change: None,
                source: None,
            }))
            .await?;
        }

        switch_state(
            &mut info.data,
            DeleteAccountsState::MtCoreAccountsBlocked,
            DeleteAccountsState::AccountsMarkedAsDeleted,
        )?;
        record_transition(OPERATION_NAME, true);
        ctx.executions.save(&mut info).await?;
    } else if info.data.state != DeleteAccountsState::AccountsMarkedAsDeleted {
        record_transition(OPERATION_NAME, false);
        return Ok(());
    }

    ctx.publish(Event::AccountsMarkedAsDeleted(AccountsMarkedAsDeleted {
        operation_id: operation_id.clone(),
        deleted_account_ids: info.data.remaining(),
    }))
    .await
}

pub async fn on_marked(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    let Some(info) = load(ctx, operation_id).await? else {
        return Ok(());
    };
    if !ensure_state(&info.data, DeleteAccountsState::AccountsMarkedAsDeleted)? {
        record_transition(OPERATION_NAME, false);
        return Ok(());
    }

    ctx.send(Command::FinishAccountsDeletion(OperationRef::new(
        operation_id.clone(),
    )))
    .await
}

/// Tells the trading engine which accounts are gone, records and publishes
/// the outcome, and removes the execution info.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id))]
pub async fn finish(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    let operation_id = &command.operation_id;
    let Some(mut info) = load(ctx, operation_id).await? else {
        return Ok(());
    };

    let deleted_account_ids = info.data.remaining();
    if ensure_state(&info.data, DeleteAccountsState::AccountsMarkedAsDeleted)? {
        let failed: Vec<AccountId> = info.data.failed_account_ids.keys().cloned().collect();
        ctx.trading_engine
            .finish_accounts_deletion(operation_id, &deleted_account_ids, &failed)
            .await
            .map_err(|e| SagaError::CompensationFailed {
                step: "FinishAccountsDeletion".to_string(),
                reason: e.to_string(),
            })?;

        switch_state(
            &mut info.data,
            DeleteAccountsState::AccountsMarkedAsDeleted,
            DeleteAccountsState::Finished,
        )?;
        record_transition(OPERATION_NAME, true);
        ctx.executions.save(&mut info).await?;
    }

    ctx.executions
        .get_or_add(OUTCOME_NAME, operation_id, || DeleteAccountsOutcome {
            deleted_account_ids: deleted_account_ids.clone(),
            failed_account_ids: info.data.failed_account_ids.clone(),
        })
        .await?;

    tracing::info!(
        deleted = deleted_account_ids.len(),
        failed = info.data.failed_account_ids.len(),
        "accounts deletion finished"
    );
    metrics::counter!("operations_succeeded_total", "saga" => OPERATION_NAME).increment(1);
    ctx.publish(Event::AccountsDeletionFinished(AccountsDeletionFinished {
        operation_id: operation_id.clone(),
        deleted_account_ids,
        failed_account_ids: info.data.failed_account_ids.clone(),
    }))
    .await?;
    ctx.executions.delete(&info).await?;
    Ok(())
}
