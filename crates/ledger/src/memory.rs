use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::AccountId;
use tokio::sync::{Mutex, RwLock};

use crate::account::{Account, AccountFilter, AccountFlags, TemporaryCapital};
use crate::balance_change::{AccountBalanceChange, BalanceChangeQuery};
use crate::repository::{AccountsRepository, BalanceUpdate, BalanceUpdateOutcome, LedgerSettings};
use crate::{LedgerError, Result};

/// One account and its balance change log, guarded together.
#[derive(Debug)]
struct AccountRow {
    account: Account,
    history: Vec<AccountBalanceChange>,
}

/// In-memory accounts repository.
///
/// Each account row sits behind its own async mutex, which plays the role of
/// a database row lock: mutations of the same account are serialized while
/// different accounts proceed in parallel.
#[derive(Clone, Default)]
pub struct InMemoryAccountsRepository {
    rows: Arc<RwLock<BTreeMap<AccountId, Arc<Mutex<AccountRow>>>>>,
    settings: LedgerSettings,
}

impl InMemoryAccountsRepository {
    /// Creates an empty repository with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty repository with the given settings.
    pub fn with_settings(settings: LedgerSettings) -> Self {
        Self {
            rows: Arc::default(),
            settings,
        }
    }

    /// Total number of balance change log entries across all accounts.
    pub async fn balance_change_count(&self) -> usize {
        let rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        let mut count = 0;
        for row in rows {
            count += row.lock().await.history.len();
        }
        count
    }

    async fn row(&self, account_id: &AccountId) -> Result<Arc<Mutex<AccountRow>>> {
        self.rows
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    async fn mutate<F>(&self, account_id: &AccountId, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) + Send,
    {
        let row = self.row(account_id).await?;
        let mut row = row.lock().await;
        f(&mut row.account);
        row.account.modification_timestamp = Utc::now();
        Ok(row.account.clone())
    }
}

#[async_trait]
impl AccountsRepository for InMemoryAccountsRepository {
    async fn add(&self, account: Account) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&account.id) {
            return Err(LedgerError::DuplicateAccount(account.id.to_string()));
        }
        rows.insert(
            account.id.clone(),
            Arc::new(Mutex::new(AccountRow {
                account,
                history: Vec::new(),
            })),
        );
        Ok(())
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let row = self.rows.read().await.get(account_id).cloned();
        match row {
            Some(row) => Ok(Some(row.lock().await.account.clone())),
            None => Ok(None),
        }
    }

    async fn get_all(&self, filter: &AccountFilter) -> Result<Vec<Account>> {
        let rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        let mut accounts = Vec::new();
        for row in rows {
            let row = row.lock().await;
            if filter.matches(&row.account) {
                accounts.push(row.account.clone());
            }
        }
        Ok(accounts)
    }

    #[tracing::instrument(skip(self, update), fields(operation_id = %update.operation_id, account_id = %update.account_id))]
    async fn update_balance(&self, update: BalanceUpdate) -> Result<BalanceUpdateOutcome> {
        let row = self.row(&update.account_id).await?;
        let mut row = row.lock().await;

        let previous = row
            .history
            .iter()
            .find(|change| change.id == update.operation_id)
            .cloned();
        if previous.is_some() {
            metrics::counter!("ledger_duplicate_operations_total").increment(1);
            tracing::debug!("operation already applied, balance left unchanged");
            return Ok(BalanceUpdateOutcome {
                account: row.account.clone(),
                change: previous,
                applied: false,
            });
        }
        if let Err(e) = row
            .account
            .admit_balance_update(&update, self.settings.recent_operations_capacity)
        {
            metrics::counter!("ledger_refused_operations_total").increment(1);
            tracing::warn!(error = %e, "balance change refused");
            return Err(e);
        }

        let change = row.account.apply_balance_update(
            &update,
            self.settings.recent_operations_capacity,
            Utc::now(),
        );
        row.history.push(change.clone());
        metrics::counter!("ledger_balance_updates_total").increment(1);

        Ok(BalanceUpdateOutcome {
            account: row.account.clone(),
            change: Some(change),
            applied: true,
        })
    }

    async fn update_temporary_capital(
        &self,
        account_id: &AccountId,
        item: TemporaryCapital,
        add: bool,
    ) -> Result<Account> {
        self.mutate(account_id, |account| {
            account.apply_temporary_capital(item, add)
        })
        .await
    }

    async fn rollback_temporary_capital(
        &self,
        account_id: &AccountId,
        items: &[TemporaryCapital],
    ) -> Result<Account> {
        self.mutate(account_id, |account| {
            account.restore_temporary_capital(items)
        })
        .await
    }

    async fn update_flags(&self, account_id: &AccountId, flags: AccountFlags) -> Result<Account> {
        self.mutate(account_id, |account| account.apply_flags(flags))
            .await
    }

    async fn mark_as_deleted(&self, account_id: &AccountId) -> Result<Account> {
        self.mutate(account_id, |account| account.is_deleted = true)
            .await
    }

    async fn get_balance_changes(
        &self,
        query: &BalanceChangeQuery,
    ) -> Result<Vec<AccountBalanceChange>> {
        let Some(row) = self.rows.read().await.get(&query.account_id).cloned() else {
            return Ok(Vec::new());
        };
        let row = row.lock().await;
        Ok(row
            .history
            .iter()
            .filter(|change| query.matches(change))
            .cloned()
            .collect())
    }
}
