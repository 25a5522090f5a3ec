//! Pieces shared by the deposit and withdrawal sagas.

use std::fmt::Debug;

use common::{AccountId, ClientId, OperationId};
use execution_store::OperationExecutionInfo;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::messages::{BeginFundsOperation, Command};
use crate::state::{SagaData, record_transition, switch_state};

/// Execution-info payload of a deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsOperationData<S> {
    pub client_id: ClientId,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub comment: String,
    pub audit_log: String,
    pub fail_reason: Option<String>,
    pub state: S,
}

impl<S> FundsOperationData<S> {
    pub fn new(command: &BeginFundsOperation, state: S) -> Self {
        Self {
            client_id: command.client_id.clone(),
            account_id: command.account_id.clone(),
            amount: command.amount,
            comment: command.comment.clone(),
            audit_log: command.audit_log.clone(),
            fail_reason: None,
            state,
        }
    }
}

impl<S: Copy + Ord + Debug> SagaData for FundsOperationData<S> {
    type State = S;

    fn state(&self) -> S {
        self.state
    }

    fn set_state(&mut self, state: S) {
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Deposit,
    Withdrawal,
}

/// Checks whether the operation may start. Returns the rejection reason,
/// or `None` if it may.
pub(crate) async fn check_account<S>(
    ctx: &SagaContext,
    data: &FundsOperationData<S>,
    direction: Direction,
) -> Result<Option<String>> {
    if data.amount <= Decimal::ZERO {
        return Ok(Some(format!("amount must be positive, got {}", data.amount)));
    }

    let Some(account) = ctx.accounts.get(&data.account_id).await? else {
        return Ok(Some(format!("account {} not found", data.account_id)));
    };
    if account.is_deleted {
        return Ok(Some(format!("account {} is deleted", account.id)));
    }
    if account.client_id != data.client_id {
        return Ok(Some(format!(
            "account {} does not belong to client {}",
            account.id, data.client_id
        )));
    }
    if account.is_disabled {
        return Ok(Some(format!("account {} is disabled", account.id)));
    }

    if direction == Direction::Withdrawal {
        if account.is_withdrawal_disabled {
            return Ok(Some(format!(
                "withdrawals are disabled for account {}",
                account.id
            )));
        }
        if account.balance < data.amount {
            return Ok(Some(format!(
                "insufficient balance: {} available, {} requested",
                account.balance, data.amount
            )));
        }
    }

    Ok(None)
}

/// Moves a funds saga from `expected` to `next` and sends the command built
/// from its data. Nothing is sent if the saga is already past `expected`.
///
/// The command goes out before the record is saved. If the save then fails
/// the message is retried, finds the saga advanced or not, and at worst sends
/// the command twice, which every command handler tolerates.
pub(crate) async fn advance<S, F>(
    ctx: &SagaContext,
    operation_name: &'static str,
    operation_id: &OperationId,
    (expected, next): (S, S),
    fail_reason: Option<String>,
    make_command: F,
) -> Result<()>
where
    S: Copy + Ord + Debug + Serialize + DeserializeOwned,
    F: FnOnce(&FundsOperationData<S>) -> Command,
{
    let mut info: OperationExecutionInfo<FundsOperationData<S>> =
        ctx.load(operation_name, operation_id).await?;

    let advanced = switch_state(&mut info.data, expected, next)?;
    record_transition(operation_name, advanced);
    if !advanced {
        return Ok(());
    }

    if fail_reason.is_some() {
        info.data.fail_reason = fail_reason;
    }
    tracing::info!(
        saga = operation_name,
        %operation_id,
        from = ?expected,
        to = ?next,
        "saga state changed"
    );

    ctx.send(make_command(&info.data)).await?;
    ctx.executions.save(&mut info).await?;
    Ok(())
}

/// Loads a funds operation for the command that reports its outcome.
///
/// Returns `None` if the saga ended in `other` instead of `settled`, and
/// `StateNotReached` while it is still in flight.
pub(crate) async fn load_settled<S>(
    ctx: &SagaContext,
    operation_name: &'static str,
    operation_id: &OperationId,
    settled: S,
    other: S,
) -> Result<Option<OperationExecutionInfo<FundsOperationData<S>>>>
where
    S: Copy + Ord + Debug + DeserializeOwned,
{
    let info: OperationExecutionInfo<FundsOperationData<S>> =
        ctx.load(operation_name, operation_id).await?;

    let state = info.data.state;
    if state == settled {
        return Ok(Some(info));
    }
    if state == other {
        record_transition(operation_name, false);
        return Ok(None);
    }
    Err(SagaError::StateNotReached {
        expected: format!("{settled:?}"),
        actual: format!("{state:?}"),
    })
}
