//! Public facade: account management and the entry points that start
//! operations.
//!
//! Entry points only validate the shape of a request and put a command on
//! the bus. Whether the operation succeeds is decided by its saga and can be
//! read back with [`AccountsService::operation_state`].

use std::collections::BTreeSet;

use common::{AccountId, ClientId, OperationId};
use execution_store::ExecutionInfoRecord;
use ledger::{
    Account, AccountBalanceChange, AccountBalanceChangeReasonType, AccountFilter, AccountFlags,
    BalanceChangeQuery, LedgerError,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::messages::{
    AccountChangeType, AccountChanged, BeginFundsOperation, ChangeSource, Command, DeleteAccounts,
    Event, StartTemporaryCapital, TemporaryCapitalKind, UpdateBalanceInternal,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccount {
    /// Generated if absent.
    pub account_id: Option<AccountId>,
    pub client_id: ClientId,
    pub trading_condition_id: String,
    pub base_asset_id: String,
    pub legal_entity: String,
}

/// Deposit or withdrawal request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsRequest {
    /// Generated if absent. Resubmitting with the same id is a no-op.
    pub operation_id: Option<OperationId>,
    pub client_id: ClientId,
    pub account_id: AccountId,
    pub amount: Decimal,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub audit_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualChargeRequest {
    pub operation_id: Option<OperationId>,
    pub account_id: AccountId,
    /// Signed; a negative amount charges the account.
    pub amount_delta: Decimal,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub audit_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiveTemporaryCapitalRequest {
    pub operation_id: Option<OperationId>,
    pub account_id: AccountId,
    /// Id of the new temporary capital entry.
    pub event_source_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub audit_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeTemporaryCapitalRequest {
    pub operation_id: Option<OperationId>,
    pub account_id: AccountId,
    /// Entry to revoke; `None` revokes every entry.
    pub event_source_id: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub audit_log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAccountsRequest {
    pub operation_id: Option<OperationId>,
    pub account_ids: Vec<AccountId>,
    #[serde(default)]
    pub comment: String,
}

#[derive(Clone)]
pub struct AccountsService {
    ctx: SagaContext,
}

impl AccountsService {
    pub fn new(ctx: SagaContext) -> Self {
        Self { ctx }
    }

    /// Creates an account with zero balance.
    ///
    /// A client may own at most one live account per base asset and trading
    /// condition.
    #[tracing::instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn create_account(&self, request: CreateAccount) -> Result<Account> {
        let owned = self
            .ctx
            .accounts
            .get_all(&AccountFilter::new().client_id(request.client_id.clone()))
            .await?;
        if let Some(existing) = owned.iter().find(|account| {
            account.base_asset_id == request.base_asset_id
                && account.trading_condition_id == request.trading_condition_id
        }) {
            return Err(LedgerError::DuplicateAccount(format!(
                "client {} already owns {} for {}/{}",
                request.client_id, existing.id, request.base_asset_id, request.trading_condition_id
            ))
            .into());
        }

        let account = Account::new(
            request.account_id.unwrap_or_else(AccountId::generate),
            request.client_id,
            request.trading_condition_id,
            request.base_asset_id,
            request.legal_entity,
        );
        self.ctx.accounts.add(account.clone()).await?;
        tracing::info!(account_id = %account.id, "account created");

        self.publish_changed(&account, AccountChangeType::Created).await?;
        Ok(account)
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_account(
        &self,
        account_id: &AccountId,
        flags: AccountFlags,
    ) -> Result<Account> {
        let account = self.ctx.accounts.update_flags(account_id, flags).await?;
        self.publish_changed(&account, AccountChangeType::Updated).await?;
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        Ok(self.ctx.accounts.get(account_id).await?)
    }

    pub async fn list_accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>> {
        Ok(self.ctx.accounts.get_all(filter).await?)
    }

    pub async fn get_balance_changes(
        &self,
        query: &BalanceChangeQuery,
    ) -> Result<Vec<AccountBalanceChange>> {
        Ok(self.ctx.accounts.get_balance_changes(query).await?)
    }

    /// Raw execution info of an operation, `None` if unknown or already
    /// cleaned up.
    pub async fn operation_state(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<Option<ExecutionInfoRecord>> {
        Ok(self
            .ctx
            .executions
            .get_raw(operation_name, operation_id)
            .await?)
    }

    pub async fn begin_deposit(&self, request: FundsRequest) -> Result<OperationId> {
        let command = funds_command(request)?;
        let operation_id = command.operation_id.clone();
        self.ctx.send(Command::BeginDeposit(command)).await?;
        Ok(operation_id)
    }

    pub async fn begin_withdrawal(&self, request: FundsRequest) -> Result<OperationId> {
        let command = funds_command(request)?;
        let operation_id = command.operation_id.clone();
        self.ctx.send(Command::BeginWithdrawal(command)).await?;
        Ok(operation_id)
    }

    /// Applies a signed balance change outside of any saga.
    pub async fn charge_manually(&self, request: ManualChargeRequest) -> Result<OperationId> {
        if request.amount_delta.is_zero() {
            return Err(SagaError::Validation("amount must not be zero".to_string()));
        }
        let operation_id = request.operation_id.unwrap_or_else(OperationId::generate);
        self.ctx
            .send(Command::UpdateBalanceInternal(UpdateBalanceInternal {
                operation_id: operation_id.clone(),
                account_id: request.account_id,
                amount_delta: request.amount_delta,
                change_limit: false,
                reason_type: AccountBalanceChangeReasonType::Manual,
                source: ChangeSource::ManualCharge,
                event_source_id: request.reason,
                comment: request.comment,
                audit_log: request.audit_log,
            }))
            .await?;
        Ok(operation_id)
    }

    pub async fn give_temporary_capital(
        &self,
        request: GiveTemporaryCapitalRequest,
    ) -> Result<OperationId> {
        if request.amount <= Decimal::ZERO {
            return Err(SagaError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.event_source_id.trim().is_empty() {
            return Err(SagaError::Validation(
                "temporary capital id is required".to_string(),
            ));
        }

        let operation_id = request.operation_id.unwrap_or_else(OperationId::generate);
        self.ctx
            .send(Command::StartTemporaryCapital(StartTemporaryCapital {
                kind: TemporaryCapitalKind::Give,
                operation_id: operation_id.clone(),
                account_id: request.account_id,
                event_source_id: Some(request.event_source_id),
                amount: request.amount,
                reason: request.reason,
                comment: request.comment,
                audit_log: request.audit_log,
            }))
            .await?;
        Ok(operation_id)
    }

    pub async fn revoke_temporary_capital(
        &self,
        request: RevokeTemporaryCapitalRequest,
    ) -> Result<OperationId> {
        let operation_id = request.operation_id.unwrap_or_else(OperationId::generate);
        self.ctx
            .send(Command::StartTemporaryCapital(StartTemporaryCapital {
                kind: TemporaryCapitalKind::Revoke,
                operation_id: operation_id.clone(),
                account_id: request.account_id,
                event_source_id: request.event_source_id.filter(|id| !id.trim().is_empty()),
                amount: Decimal::ZERO,
                reason: request.reason,
                comment: request.comment,
                audit_log: request.audit_log,
            }))
            .await?;
        Ok(operation_id)
    }

    /// Starts deleting a batch of accounts. Duplicate ids are collapsed.
    pub async fn delete_accounts(&self, request: DeleteAccountsRequest) -> Result<OperationId> {
        let mut seen = BTreeSet::new();
        let account_ids: Vec<AccountId> = request
            .account_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if account_ids.is_empty() {
            return Err(SagaError::Validation(
                "at least one account id is required".to_string(),
            ));
        }

        let operation_id = request.operation_id.unwrap_or_else(OperationId::generate);
        self.ctx
            .send(Command::DeleteAccounts(DeleteAccounts {
                operation_id: operation_id.clone(),
                account_ids,
                comment: request.comment,
            }))
            .await?;
        Ok(operation_id)
    }

    async fn publish_changed(&self, account: &Account, event_type: AccountChangeType) -> Result<()> {
        self.ctx
            .publish(Event::AccountChanged(AccountChanged {
                operation_id: OperationId::generate(),
                account: account.clone(),
                event_type,
                balance_change: None,
                source: None,
            }))
            .await
    }
}

fn funds_command(request: FundsRequest) -> Result<BeginFundsOperation> {
    if request.amount <= Decimal::ZERO {
        return Err(SagaError::Validation(format!(
            "amount must be positive, got {}",
            request.amount
        )));
    }
    Ok(BeginFundsOperation {
        operation_id: request.operation_id.unwrap_or_else(OperationId::generate),
        client_id: request.client_id,
        account_id: request.account_id,
        amount: request.amount,
        comment: request.comment,
        audit_log: request.audit_log,
    })
}
