//! Read-only views of accounts and operation progress.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{AccountId, OperationId};
use execution_store::ExecutionInfoRecord;
use ledger::{Account, AccountBalanceChange, BalanceChangeQuery};

use crate::AppState;
use crate::error::ApiError;

/// GET /accounts/{id}
#[tracing::instrument(skip(state))]
pub async fn account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Account>, ApiError> {
    let account_id = AccountId::new(id);
    state
        .service
        .get_account(&account_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("account {account_id} not found")))
}

/// GET /accounts/{id}/balance-changes
#[tracing::instrument(skip(state))]
pub async fn balance_changes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AccountBalanceChange>>, ApiError> {
    let account_id = AccountId::new(id);
    if state.service.get_account(&account_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("account {account_id} not found")));
    }
    let changes = state
        .service
        .get_balance_changes(&BalanceChangeQuery::for_account(account_id))
        .await?;
    Ok(Json(changes))
}

/// GET /operations/{name}/{id}: the persisted progress of a saga.
///
/// Finished delete-accounts operations remove their record; their result is
/// kept under `DeleteAccountsOutcome`.
#[tracing::instrument(skip(state))]
pub async fn operation(
    State(state): State<Arc<AppState>>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<ExecutionInfoRecord>, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("operation name is required".to_string()));
    }
    let operation_id = OperationId::new(id);
    state
        .service
        .operation_state(&name, &operation_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("operation {name}/{operation_id} not found")))
}
