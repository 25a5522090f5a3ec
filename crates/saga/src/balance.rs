//! Ledger command handler shared by every flow that moves a balance.

use ledger::{BalanceUpdate, LedgerError};

use crate::context::SagaContext;
use crate::error::Result;
use crate::messages::{
    AccountBalanceChangeFailed, AccountChangeType, AccountChanged, Event, UpdateBalanceInternal,
};

/// Applies a balance delta and reports the outcome as an event.
///
/// A replayed command is not applied again, but its `AccountChanged` event is
/// published again so a saga that missed the first one can still advance.
#[tracing::instrument(skip(ctx, command), fields(operation_id = %command.operation_id, account_id = %command.account_id, source = ?command.source))]
pub async fn update_balance(ctx: &SagaContext, command: &UpdateBalanceInternal) -> Result<()> {
    let update = BalanceUpdate::new(
        command.operation_id.clone(),
        command.account_id.clone(),
        command.amount_delta,
        command.reason_type,
    )
    .change_limit(command.change_limit)
    .event_source_id(command.event_source_id.clone())
    .comment(command.comment.clone())
    .audit_log(command.audit_log.clone());

    match ctx.accounts.update_balance(update).await {
        Ok(outcome) => {
            if outcome.applied {
                tracing::info!(
                    delta = %command.amount_delta,
                    balance = %outcome.account.balance,
                    "balance updated"
                );
            }
            ctx.publish(Event::AccountChanged(AccountChanged {
                operation_id: command.operation_id.clone(),
                account: outcome.account,
                event_type: AccountChangeType::BalanceUpdated,
                balance_change: outcome.change,
                source: Some(command.source),
            }))
            .await
        }
        Err(LedgerError::AccountNotFound(account_id)) => {
            tracing::warn!("balance change refused, account not found");
            publish_refusal(ctx, command, format!("account {account_id} not found")).await
        }
        Err(e @ LedgerError::InsufficientBalance { .. }) => {
            tracing::warn!(error = %e, "balance change refused");
            publish_refusal(ctx, command, e.to_string()).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn publish_refusal(
    ctx: &SagaContext,
    command: &UpdateBalanceInternal,
    reason: String,
) -> Result<()> {
    ctx.publish(Event::AccountBalanceChangeFailed(AccountBalanceChangeFailed {
        operation_id: command.operation_id.clone(),
        account_id: command.account_id.clone(),
        source: command.source,
        reason,
    }))
    .await
}
