//! Deposit saga.
//!
//! ```text
//! Created ──► FreezingAmount ──► UpdatingBalance ──┬──► Succeeded
//!    │                                             └──► Failed
//!    └──► Failed (rejected at start)
//! ```

use common::OperationId;
use ledger::AccountBalanceChangeReasonType;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::Result;
use crate::funds::{Direction, FundsOperationData, advance, check_account, load_settled};
use crate::messages::{
    BeginFundsOperation, ChangeSource, Command, Event, FundsOperationSucceeded, OperationFailed,
    OperationRef, UpdateBalanceInternal,
};
use crate::state::record_transition;

pub const OPERATION_NAME: &str = "Deposit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DepositState {
    Created,
    FreezingAmount,
    UpdatingBalance,
    Succeeded,
    Failed,
}

pub type DepositData = FundsOperationData<DepositState>;

/// Handles `BeginDeposit`: records the operation and validates it.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, account_id = %command.account_id))]
pub async fn begin(ctx: &SagaContext, command: &BeginFundsOperation) -> Result<()> {
    let (info, _) = ctx
        .executions
        .get_or_add(OPERATION_NAME, &command.operation_id, || {
            DepositData::new(command, DepositState::Created)
        })
        .await?;

    if info.data.state != DepositState::Created {
        record_transition(OPERATION_NAME, false);
        return Ok(());
    }

    let operation_id = command.operation_id.clone();
    match check_account(ctx, &info.data, Direction::Deposit).await? {
        None => {
            ctx.publish(Event::DepositStarted(OperationRef::new(operation_id)))
                .await
        }
        Some(reason) => {
            tracing::warn!(%reason, "deposit rejected");
            ctx.publish(Event::DepositStartFailed(OperationFailed {
                operation_id,
                reason,
            }))
            .await
        }
    }
}

/// Deposits hold no margin; the freeze step only keeps the flow symmetric
/// with withdrawals.
pub async fn freeze_amount(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    ctx.publish(Event::AmountForDepositFrozen(command.clone()))
        .await
}

pub async fn complete(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    let Some(info) = load_settled(
        ctx,
        OPERATION_NAME,
        &command.operation_id,
        DepositState::Succeeded,
        DepositState::Failed,
    )
    .await?
    else {
        return Ok(());
    };
    tracing::info!(operation_id = %command.operation_id, amount = %info.data.amount, "deposit succeeded");
    metrics::counter!("operations_succeeded_total", "saga" => OPERATION_NAME).increment(1);

    ctx.publish(Event::DepositSucceeded(FundsOperationSucceeded {
        operation_id: command.operation_id.clone(),
        client_id: info.data.client_id,
        account_id: info.data.account_id,
        amount: info.data.amount,
    }))
    .await
}

pub async fn fail(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    let Some(info) = load_settled(
        ctx,
        OPERATION_NAME,
        &command.operation_id,
        DepositState::Failed,
        DepositState::Succeeded,
    )
    .await?
    else {
        return Ok(());
    };
    let reason = info.data.fail_reason.unwrap_or_default();
    tracing::warn!(operation_id = %command.operation_id, %reason, "deposit failed");
    metrics::counter!("operations_failed_total", "saga" => OPERATION_NAME).increment(1);

    ctx.publish(Event::DepositFailed(OperationFailed {
        operation_id: command.operation_id.clone(),
        reason,
    }))
    .await
}

pub async fn on_started(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (DepositState::Created, DepositState::FreezingAmount),
        None,
        |_| Command::FreezeAmountForDeposit(OperationRef::new(operation_id.clone())),
    )
    .await
}

pub async fn on_start_failed(ctx: &SagaContext, event: &OperationFailed) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        &event.operation_id,
        (DepositState::Created, DepositState::Failed),
        Some(event.reason.clone()),
        |_| Command::FailDeposit(OperationRef::new(event.operation_id.clone())),
    )
    .await
}

pub async fn on_amount_frozen(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (DepositState::FreezingAmount, DepositState::UpdatingBalance),
        None,
        |data| {
            Command::UpdateBalanceInternal(UpdateBalanceInternal {
                operation_id: operation_id.clone(),
                account_id: data.account_id.clone(),
                amount_delta: data.amount,
                change_limit: true,
                reason_type: AccountBalanceChangeReasonType::Deposit,
                source: ChangeSource::Deposit,
                event_source_id: operation_id.to_string(),
                comment: data.comment.clone(),
                audit_log: data.audit_log.clone(),
            })
        },
    )
    .await
}

pub async fn on_balance_changed(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (DepositState::UpdatingBalance, DepositState::Succeeded),
        None,
        |_| Command::CompleteDeposit(OperationRef::new(operation_id.clone())),
    )
    .await
}

pub async fn on_balance_change_failed(
    ctx: &SagaContext,
    operation_id: &OperationId,
    reason: &str,
) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (DepositState::UpdatingBalance, DepositState::Failed),
        Some(reason.to_string()),
        |_| Command::FailDeposit(OperationRef::new(operation_id.clone())),
    )
    .await
}
