//! Withdrawal saga.
//!
//! ```text
//! Created ──► FreezingAmount ──► UpdatingBalance ──┬──► Succeeded
//!    │              │                              └──► UnfreezingAmount ──► Failed
//!    │              └──► Failed (freeze rejected)
//!    └──► Failed (rejected at start)
//! ```
//!
//! The trading engine holds the amount before the ledger is charged. If the
//! ledger then refuses the change the hold is released before the operation
//! is declared failed. The release is retried until it goes through.

use common::OperationId;
use ledger::AccountBalanceChangeReasonType;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::funds::{Direction, FundsOperationData, advance, check_account, load_settled};
use crate::messages::{
    BeginFundsOperation, ChangeSource, Command, Event, FundsOperationSucceeded, MarginHold,
    OperationFailed, OperationRef, UpdateBalanceInternal,
};
use crate::state::record_transition;
use crate::trading_engine::TradingEngineError;

pub const OPERATION_NAME: &str = "Withdrawal";

const FREEZE_REASON: &str = "Withdrawal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WithdrawalState {
    Created,
    FreezingAmount,
    UpdatingBalance,
    UnfreezingAmount,
    Succeeded,
    Failed,
}

pub type WithdrawalData = FundsOperationData<WithdrawalState>;

/// Handles `BeginWithdrawal`: records the operation and validates it.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, account_id = %command.account_id))]
pub async fn begin(ctx: &SagaContext, command: &BeginFundsOperation) -> Result<()> {
    let (info, _) = ctx
        .executions
        .get_or_add(OPERATION_NAME, &command.operation_id, || {
            WithdrawalData::new(command, WithdrawalState::Created)
        })
        .await?;

    if info.data.state != WithdrawalState::Created {
        record_transition(OPERATION_NAME, false);
        return Ok(());
    }

    let operation_id = command.operation_id.clone();
    match check_account(ctx, &info.data, Direction::Withdrawal).await? {
        None => {
            ctx.publish(Event::WithdrawalStarted(OperationRef::new(operation_id)))
                .await
        }
        Some(reason) => {
            tracing::warn!(%reason, "withdrawal rejected");
            ctx.publish(Event::WithdrawalStartFailed(OperationFailed {
                operation_id,
                reason,
            }))
            .await
        }
    }
}

/// Asks the trading engine to hold the withdrawn amount.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, account_id = %command.account_id))]
pub async fn freeze_amount(ctx: &SagaContext, command: &MarginHold) -> Result<()> {
    let outcome = ctx
        .trading_engine
        .freeze_amount_for_withdrawal(
            &command.operation_id,
            &command.account_id,
            command.amount,
            &command.reason,
        )
        .await;

    match outcome {
        Ok(()) => {
            ctx.publish(Event::AmountForWithdrawalFrozen(OperationRef::new(
                command.operation_id.clone(),
            )))
            .await
        }
        Err(TradingEngineError::Rejected(reason)) => {
            tracing::warn!(%reason, "freeze rejected by trading engine");
            ctx.publish(Event::AmountForWithdrawalFreezeFailed(OperationFailed {
                operation_id: command.operation_id.clone(),
                reason,
            }))
            .await
        }
        Err(e) => Err(e.into()),
    }
}

/// Releases the hold of a withdrawal the ledger refused.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, account_id = %command.account_id))]
pub async fn unfreeze_margin(ctx: &SagaContext, command: &MarginHold) -> Result<()> {
    ctx.trading_engine
        .unfreeze_margin_on_fail_withdrawal(
            &command.operation_id,
            &command.account_id,
            command.amount,
        )
        .await
        .map_err(|e| SagaError::CompensationFailed {
            step: "UnfreezeMarginOnFailWithdrawal".to_string(),
            reason: e.to_string(),
        })?;

    ctx.publish(Event::UnfreezeMarginOnFailSucceeded(OperationRef::new(
        command.operation_id.clone(),
    )))
    .await
}

pub async fn complete(ctx: &SagaContext, command: &OperationRef) -> Result<()> {
    let Some(info) = load_settled(
        ctx,
        OPERATION_NAME,
        &command.operation_id,
        WithdrawalState::Succeeded,
        WithdrawalState::Failed,
    )
    .await?
    else {
        return Ok(());
    };
    tracing::info!(operation_id = %command.operation_id, amount = %info.data.amount, "withdrawal succeeded");
    metrics::counter!("operations_succeeded_total", "saga" => OPERATION_NAME).increment(1);

    ctx.publish(Event::WithdrawalSucceeded(FundsOperationSucceeded {
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
        WithdrawalState::Failed,
        WithdrawalState::Succeeded,
    )
    .await?
    else {
        return Ok(());
    };
    let reason = info.data.fail_reason.unwrap_or_default();
    tracing::warn!(operation_id = %command.operation_id, %reason, "withdrawal failed");
    metrics::counter!("operations_failed_total", "saga" => OPERATION_NAME).increment(1);

    ctx.publish(Event::WithdrawalFailed(OperationFailed {
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
        (WithdrawalState::Created, WithdrawalState::FreezingAmount),
        None,
        |data| {
            Command::FreezeAmountForWithdrawal(MarginHold {
                operation_id: operation_id.clone(),
                account_id: data.account_id.clone(),
                amount: data.amount,
                reason: FREEZE_REASON.to_string(),
            })
        },
    )
    .await
}

pub async fn on_start_failed(ctx: &SagaContext, event: &OperationFailed) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        &event.operation_id,
        (WithdrawalState::Created, WithdrawalState::Failed),
        Some(event.reason.clone()),
        |_| Command::FailWithdrawal(OperationRef::new(event.operation_id.clone())),
    )
    .await
}

pub async fn on_amount_frozen(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (WithdrawalState::FreezingAmount, WithdrawalState::UpdatingBalance),
        None,
        |data| {
            Command::UpdateBalanceInternal(UpdateBalanceInternal {
                operation_id: operation_id.clone(),
                account_id: data.account_id.clone(),
                amount_delta: -data.amount,
                change_limit: true,
                reason_type: AccountBalanceChangeReasonType::Withdraw,
                source: ChangeSource::Withdrawal,
                event_source_id: operation_id.to_string(),
                comment: data.comment.clone(),
                audit_log: data.audit_log.clone(),
            })
        },
    )
    .await
}

pub async fn on_freeze_failed(ctx: &SagaContext, event: &OperationFailed) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        &event.operation_id,
        (WithdrawalState::FreezingAmount, WithdrawalState::Failed),
        Some(event.reason.clone()),
        |_| Command::FailWithdrawal(OperationRef::new(event.operation_id.clone())),
    )
    .await
}

pub async fn on_balance_changed(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (WithdrawalState::UpdatingBalance, WithdrawalState::Succeeded),
        None,
        |_| Command::CompleteWithdrawal(OperationRef::new(operation_id.clone())),
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
        (WithdrawalState::UpdatingBalance, WithdrawalState::UnfreezingAmount),
        Some(reason.to_string()),
        |data| {
            Command::UnfreezeMarginOnFailWithdrawal(MarginHold {
                operation_id: operation_id.clone(),
                account_id: data.account_id.clone(),
                amount: data.amount,
                reason: reason.to_string(),
            })
        },
    )
    .await
}

pub async fn on_margin_unfrozen(ctx: &SagaContext, operation_id: &OperationId) -> Result<()> {
    advance(
        ctx,
        OPERATION_NAME,
        operation_id,
        (WithdrawalState::UnfreezingAmount, WithdrawalState::Failed),
        None,
        |_| Command::FailWithdrawal(OperationRef::new(operation_id.clone())),
    )
    .await
}
