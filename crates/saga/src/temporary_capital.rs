//! Give / revoke temporary capital saga.
//!
//! ```text
//! Initiated ──► Started ──► ChargedOnAccount ──► Succeeded
//!     │            └──► Failing ──► Failed   (sub-ledger change undone)
//!     └──► Failed (rejected at start)
//! ```
//!
//! Giving adds an entry to the account's temporary capital list and credits
//! the balance. Revoking removes one entry (or all of them) and debits their
//! sum. If the balance change is refused the list change is undone.

use common::{AccountId, OperationId};
use execution_store::OperationExecutionInfo;
use ledger::{AccountBalanceChangeReasonType, TemporaryCapital};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::messages::{
    Command, Event, StartTemporaryCapital, TemporaryCapitalFailed, TemporaryCapitalKind,
    TemporaryCapitalRef, UpdateBalanceInternal,
};
use crate::state::{SagaData, ensure_state, record_transition, switch_state};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TemporaryCapitalState {
    Initiated,
    Started,
    ChargedOnAccount,
    Succeeded,
    Failing,
    Failed,
}

/// Execution-info payload of a give or revoke operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporaryCapitalData {
    pub event_source_id: Option<String>,
    pub account_id: AccountId,
    /// Amount given, or the sum of the revoked entries.
    pub amount: Decimal,
    pub reason: String,
    pub comment: String,
    pub audit_log: String,
    pub fail_reason: Option<String>,
    /// Entries removed by a revoke, kept so the removal can be undone.
    pub revoked_items: Vec<TemporaryCapital>,
    pub state: TemporaryCapitalState,
}

impl TemporaryCapitalData {
    fn new(command: &StartTemporaryCapital) -> Self {
        Self {
            event_source_id: command.event_source_id.clone(),
            account_id: command.account_id.clone(),
            amount: command.amount,
            reason: command.reason.clone(),
            comment: command.comment.clone(),
            audit_log: command.audit_log.clone(),
            fail_reason: None,
            revoked_items: Vec::new(),
            state: TemporaryCapitalState::Initiated,
        }
    }

    fn given_item(&self) -> TemporaryCapital {
        TemporaryCapital::new(self.event_source_id.clone().unwrap_or_default(), self.amount)
    }

    fn balance_delta(&self, kind: TemporaryCapitalKind) -> Decimal {
        match kind {
            TemporaryCapitalKind::Give => self.amount,
            TemporaryCapitalKind::Revoke => -self.amount,
        }
    }
}

impl SagaData for TemporaryCapitalData {
    type State = TemporaryCapitalState;

    fn state(&self) -> TemporaryCapitalState {
        self.state
    }

    fn set_state(&mut self, state: TemporaryCapitalState) {
        self.state = state;
    }
}

type Info = OperationExecutionInfo<TemporaryCapitalData>;

/// Checks the request and, for a revoke, resolves the entries to remove.
/// Returns the rejection reason, if any.
async fn validate(
    ctx: &SagaContext,
    kind: TemporaryCapitalKind,
    data: &mut TemporaryCapitalData,
) -> Result<Option<String>> {
    let Some(account) = ctx.accounts.get(&data.account_id).await? else {
        return Ok(Some(format!("account {} not found", data.account_id)));
    };
    if account.is_deleted {
        return Ok(Some(format!("account {} is deleted", account.id)));
    }
    if account.is_disabled {
        return Ok(Some(format!("account {} is disabled", account.id)));
    }

    match kind {
        TemporaryCapitalKind::Give => {
            if data.amount <= Decimal::ZERO {
                return Ok(Some(format!("amount must be positive, got {}", data.amount)));
            }
            let Some(ref id) = data.event_source_id else {
                return Ok(Some("event source id is required".to_string()));
            };
            if account.find_temporary_capital(id).is_some() {
                return Ok(Some(format!(
                    "temporary capital {id} already exists on account {}",
                    account.id
                )));
            }
        }
        TemporaryCapitalKind::Revoke => {
            let items = match data.event_source_id {
                Some(ref id) => match account.find_temporary_capital(id) {
                    Some(item) => vec![item.clone()],
                    None => {
                        return Ok(Some(format!(
                            "temporary capital {id} not found on account {}",
                            account.id
                        )));
                    }
                },
                None => account.temporary_capital.clone(),
            };
            if items.is_empty() {
                return Ok(Some(format!(
                    "account {} has no temporary capital to revoke",
                    account.id
                )));
            }

            let total: Decimal = items.iter().map(|item| item.amount).sum();
            if account.balance < total {
                return Ok(Some(format!(
                    "insufficient balance to revoke {total}: {} available",
                    account.balance
                )));
            }
            data.amount = total;
            data.revoked_items = items;
        }
    }

    Ok(None)
}

/// Applies the sub-ledger change. Safe to repeat.
async fn write_capital(
    ctx: &SagaContext,
    kind: TemporaryCapitalKind,
    data: &TemporaryCapitalData,
) -> Result<()> {
    match kind {
        TemporaryCapitalKind::Give => {
            ctx.accounts
                .update_temporary_capital(&data.account_id, data.given_item(), true)
                .await?;
        }
        TemporaryCapitalKind::Revoke => {
            for item in &data.revoked_items {
                ctx.accounts
                    .update_temporary_capital(&data.account_id, item.clone(), false)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Undoes the sub-ledger change.
async fn undo_capital(
    ctx: &SagaContext,
    kind: TemporaryCapitalKind,
    data: &TemporaryCapitalData,
) -> Result<()> {
    let undone = match kind {
        TemporaryCapitalKind::Give => {
            ctx.accounts
                .update_temporary_capital(&data.account_id, data.given_item(), false)
                .await
        }
        TemporaryCapitalKind::Revoke => {
            ctx.accounts
                .rollback_temporary_capital(&data.account_id, &data.revoked_items)
                .await
        }
    };
    undone.map(|_| ()).map_err(|e| SagaError::CompensationFailed {
        step: format!("Rollback{}", kind.operation_name()),
        reason: e.to_string(),
    })
}

async fn publish_failed(
    ctx: &SagaContext,
    kind: TemporaryCapitalKind,
    info: &Info,
) -> Result<()> {
    let reason = info.data.fail_reason.clone().unwrap_or_default();
    tracing::warn!(operation_id = %info.id, %reason, "temporary capital operation failed");
    ctx.publish(Event::TemporaryCapitalFailed(TemporaryCapitalFailed {
        kind,
        operation_id: info.id.clone(),
        reason,
    }))
    .await
}

/// Handles `StartTemporaryCapital`.
///
/// The `Started` state is saved before the sub-ledger is touched, so a
/// redelivered command that finds the saga in `Started` redoes the (idempotent)
/// write and republishes `TemporaryCapitalStarted`.
#[tracing::instrument(skip(ctx, command), fields(kind = ?command.kind, operation_id = %command.operation_id, account_id = %command.account_id))]
pub async fn start(ctx: &SagaContext, command: &StartTemporaryCapital) -> Result<()> {
    let kind = command.kind;
    let saga = kind.operation_name();
    let (mut info, _) = ctx
        .executions
        .get_or_add(saga, &command.operation_id, || {
            TemporaryCapitalData::new(command)
        })
        .await?;

    match info.data.state {
        TemporaryCapitalState::Initiated => {
            if let Some(reason) = validate(ctx, kind, &mut info.data).await? {
                switch_state(
                    &mut info.data,
                    TemporaryCapitalState::Initiated,
                    TemporaryCapitalState::Failed,
                )?;
                record_transition(saga, true);
                info.data.fail_reason = Some(reason);
                ctx.executions.save(&mut info).await?;
                return publish_failed(ctx, kind, &info).await;
            }

            switch_state(
                &mut info.data,
                TemporaryCapitalState::Initiated,
                TemporaryCapitalState::Started,
            )?;
            record_transition(saga, true);
            ctx.executions.save(&mut info).await?;
        }
        TemporaryCapitalState::Started => {}
        _ => {
            record_transition(saga, false);
            return Ok(());
        }
    }

    write_capital(ctx, kind, &info.data).await?;
    tracing::info!(amount = %info.data.amount, "temporary capital written");
    ctx.publish(Event::TemporaryCapitalStarted(TemporaryCapitalRef {
        kind,
        operation_id: command.operation_id.clone(),
    }))
    .await
}

/// Reacts to `TemporaryCapitalStarted` by charging the account.
pub async fn on_started(ctx: &SagaContext, event: &TemporaryCapitalRef) -> Result<()> {
    let kind = event.kind;
    let info: Info = ctx.load(kind.operation_name(), &event.operation_id).await?;

    if !ensure_state(&info.data, TemporaryCapitalState::Started)? {
        record_transition(kind.operation_name(), false);
        return Ok(());
    }

    ctx.send(Command::UpdateBalanceInternal(UpdateBalanceInternal {
        operation_id: event.operation_id.clone(),
        account_id: info.data.account_id.clone(),
        amount_delta: info.data.balance_delta(kind),
        change_limit: false,
        reason_type: AccountBalanceChangeReasonType::TemporaryCashAdjustment,
        source: kind.source(),
        event_source_id: info.data.event_source_id.clone().unwrap_or_default(),
        comment: info.data.comment.clone(),
        audit_log: info.data.audit_log.clone(),
    }))
    .await
}

/// Reacts to the ledger outcome. `fail_reason` is set if the balance change
/// was refused.
pub async fn on_balance_outcome(
    ctx: &SagaContext,
    kind: TemporaryCapitalKind,
    operation_id: &OperationId,
    fail_reason: Option<String>,
) -> Result<()> {
    let saga = kind.operation_name();
    let mut info: Info = ctx.load(saga, operation_id).await?;

    let next = match fail_reason {
        None => TemporaryCapitalState::ChargedOnAccount,
        Some(_) => TemporaryCapitalState::Failing,
    };
    let advanced = switch_state(&mut info.data, TemporaryCapitalState::Started, next)?;
    record_transition(saga, advanced);
    if !advanced {
        return Ok(());
    }
    if fail_reason.is_some() {
        info.data.fail_reason = fail_reason;
    }
    tracing::info!(%operation_id, to = ?next, "temporary capital state changed");

    ctx.send(Command::FinishTemporaryCapital(TemporaryCapitalRef {
        kind,
        operation_id: operation_id.clone(),
    }))
    .await?;
    ctx.executions.save(&mut info).await?;
    Ok(())
}

/// Handles `FinishTemporaryCapital`: settles the operation, undoing the
/// sub-ledger change first if the balance change was refused.
#[tracing::instrument(skip(ctx, command), fields(kind = ?command.kind, operation_id = %command.operation_id))]
pub async fn finish(ctx: &SagaContext, command: &TemporaryCapitalRef) -> Result<()> {
    let kind = command.kind;
    let saga = kind.operation_name();
    let mut info: Info = ctx.load(saga, &command.operation_id).await?;

    match info.data.state {
        TemporaryCapitalState::ChargedOnAccount => {
            switch_state(
                &mut info.data,
                TemporaryCapitalState::ChargedOnAccount,
                TemporaryCapitalState::Succeeded,
            )?;
            record_transition(saga, true);
            ctx.executions.save(&mut info).await?;
        }
        TemporaryCapitalState::Failing => {
            undo_capital(ctx, kind, &info.data).await?;
            switch_state(
                &mut info.data,
                TemporaryCapitalState::Failing,
                TemporaryCapitalState::Failed,
            )?;
            record_transition(saga, true);
            ctx.executions.save(&mut info).await?;
        }
        TemporaryCapitalState::Initiated | TemporaryCapitalState::Started => {
            return Err(SagaError::StateNotReached {
                expected: format!("{:?}", TemporaryCapitalState::ChargedOnAccount),
                actual: format!("{:?}", info.data.state),
            });
        }
        TemporaryCapitalState::Succeeded | TemporaryCapitalState::Failed => {
            record_transition(saga, false);
        }
    }

    if info.data.state == TemporaryCapitalState::Succeeded {
        tracing::info!(amount = %info.data.amount, "temporary capital operation succeeded");
        metrics::counter!("operations_succeeded_total", "saga" => saga).increment(1);
        ctx.publish(Event::TemporaryCapitalSucceeded(command.clone()))
            .await
    } else {
        metrics::counter!("operations_failed_total", "saga" => saga).increment(1);
        publish_failed(ctx, kind, &info).await
    }
}
