//! Routes each message to its handlers.

use crate::context::SagaContext;
use crate::error::Result;
use crate::messages::{ChangeSource, Command, Event, Message, TemporaryCapitalKind};
use crate::{balance, delete_accounts, deposit, temporary_capital, withdrawal};

/// Maps commands to their handler and events to the sagas subscribed to them.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: SagaContext,
}

impl Dispatcher {
    pub fn new(ctx: SagaContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SagaContext {
        &self.ctx
    }

    /// Handles one message. An error means the message was not consumed.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        match message {
            Message::Command(command) => self.handle_command(command).await,
            Message::Event(event) => self.handle_event(event).await,
        }
    }

    async fn handle_command(&self, command: &Command) -> Result<()> {
        let ctx = &self.ctx;
        match command {
            Command::BeginDeposit(c) => deposit::begin(ctx, c).await,
            Command::FreezeAmountForDeposit(c) => deposit::freeze_amount(ctx, c).await,
            Command::CompleteDeposit(c) => deposit::complete(ctx, c).await,
            Command::FailDeposit(c) => deposit::fail(ctx, c).await,

            Command::BeginWithdrawal(c) => withdrawal::begin(ctx, c).await,
            Command::FreezeAmountForWithdrawal(c) => withdrawal::freeze_amount(ctx, c).await,
            Command::UnfreezeMarginOnFailWithdrawal(c) => {
                withdrawal::unfreeze_margin(ctx, c).await
            }
            Command::CompleteWithdrawal(c) => withdrawal::complete(ctx, c).await,
            Command::FailWithdrawal(c) => withdrawal::fail(ctx, c).await,

            Command::UpdateBalanceInternal(c) => balance::update_balance(ctx, c).await,

            Command::StartTemporaryCapital(c) => temporary_capital::start(ctx, c).await,
            Command::FinishTemporaryCapital(c) => temporary_capital::finish(ctx, c).await,

            Command::DeleteAccounts(c) => delete_accounts::start(ctx, c).await,
            Command::BlockAccountsForDeletion(c) => delete_accounts::block_accounts(ctx, c).await,
            Command::MarkAccountsAsDeleted(c) => delete_accounts::mark_as_deleted(ctx, c).await,
            Command::FinishAccountsDeletion(c) => delete_accounts::finish(ctx, c).await,
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let ctx = &self.ctx;
        match event {
            Event::DepositStarted(e) => deposit::on_started(ctx, &e.operation_id).await,
            Event::DepositStartFailed(e) => deposit::on_start_failed(ctx, e).await,
            Event::AmountForDepositFrozen(e) => {
                deposit::on_amount_frozen(ctx, &e.operation_id).await
            }

            Event::WithdrawalStarted(e) => withdrawal::on_started(ctx, &e.operation_id).await,
            Event::WithdrawalStartFailed(e) => withdrawal::on_start_failed(ctx, e).await,
            Event::AmountForWithdrawalFrozen(e) => {
                withdrawal::on_amount_frozen(ctx, &e.operation_id).await
            }
            Event::AmountForWithdrawalFreezeFailed(e) => withdrawal::on_freeze_failed(ctx, e).await,
            Event::UnfreezeMarginOnFailSucceeded(e) => {
                withdrawal::on_margin_unfrozen(ctx, &e.operation_id).await
            }

            Event::AccountChanged(e) => {
                let operation_id = &e.operation_id;
                match e.source {
                    Some(ChangeSource::Deposit) => {
                        deposit::on_balance_changed(ctx, operation_id).await
                    }
                    Some(ChangeSource::Withdrawal) => {
                        withdrawal::on_balance_changed(ctx, operation_id).await
                    }
                    Some(ChangeSource::GiveTemporaryCapital) => {
                        temporary_capital::on_balance_outcome(
                            ctx,
                            TemporaryCapitalKind::Give,
                            operation_id,
                            None,
                        )
                        .await
                    }
                    Some(ChangeSource::RevokeTemporaryCapital) => {
                        temporary_capital::on_balance_outcome(
                            ctx,
                            TemporaryCapitalKind::Revoke,
                            operation_id,
                            None,
                        )
                        .await
                    }
                    Some(ChangeSource::ManualCharge) | None => Ok(()),
                }
            }
            Event::AccountBalanceChangeFailed(e) => {
                let operation_id = &e.operation_id;
                match e.source {
                    ChangeSource::Deposit => {
                        deposit::on_balance_change_failed(ctx, operation_id, &e.reason).await
                    }
                    ChangeSource::Withdrawal => {
                        withdrawal::on_balance_change_failed(ctx, operation_id, &e.reason).await
                    }
                    ChangeSource::GiveTemporaryCapital => {
                        temporary_capital::on_balance_outcome(
                            ctx,
                            TemporaryCapitalKind::Give,
                            operation_id,
                            Some(e.reason.clone()),
                        )
                        .await
                    }
                    ChangeSource::RevokeTemporaryCapital => {
                        temporary_capital::on_balance_outcome(
                            ctx,
                            TemporaryCapitalKind::Revoke,
                            operation_id,
                            Some(e.reason.clone()),
                        )
                        .await
                    }
                    ChangeSource::ManualCharge => {
                        tracing::warn!(%operation_id, reason = %e.reason, "manual charge refused");
                        Ok(())
                    }
                }
            }

            Event::TemporaryCapitalStarted(e) => temporary_capital::on_started(ctx, e).await,

            Event::DeleteAccountsStarted(e) => {
                delete_accounts::on_started(ctx, &e.operation_id).await
            }
            Event::AccountsBlockedForDeletion(e) => delete_accounts::on_blocked(ctx, e).await,
            Event::AccountsMarkedAsDeleted(e) => {
                delete_accounts::on_marked(ctx, &e.operation_id).await
            }

            // Terminal events have no subscribers inside the engine.
            Event::DepositSucceeded(_)
            | Event::DepositFailed(_)
            | Event::WithdrawalSucceeded(_)
            | Event::WithdrawalFailed(_)
            | Event::TemporaryCapitalSucceeded(_)
            | Event::TemporaryCapitalFailed(_)
            | Event::AccountsDeletionFinished(_) => Ok(()),
        }
    }
}
