use async_trait::async_trait;
use chrono::Utc;
use common::{AccountId, ClientId, OperationId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};

use crate::account::{Account, AccountFilter, AccountFlags, RecentOperations, TemporaryCapital};
use crate::balance_change::{AccountBalanceChange, BalanceChangeQuery};
use crate::repository::{AccountsRepository, BalanceUpdate, BalanceUpdateOutcome, LedgerSettings};
use crate::{LedgerError, Result};

const ACCOUNT_COLUMNS: &str = "id, client_id, trading_condition_id, base_asset_id, balance, \
     withdraw_transfer_limit, legal_entity, is_disabled, is_withdrawal_disabled, is_deleted, \
     modification_timestamp, temporary_capital, last_executed_operations";

const CHANGE_COLUMNS: &str = "id, account_id, client_id, change_timestamp, change_amount, \
     balance, withdraw_transfer_limit, comment, reason_type, event_source_id, legal_entity, \
     audit_log";

/// PostgreSQL-backed accounts repository.
///
/// Mutations run in a transaction that takes `SELECT ... FOR UPDATE` on the
/// account row. Applied operations are found through the `(account_id, id)`
/// primary key of `account_history`; refused ones through the in-row recent
/// list.
#[derive(Clone)]
pub struct PostgresAccountsRepository {
    pool: PgPool,
    settings: LedgerSettings,
}

impl PostgresAccountsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self::with_settings(pool, LedgerSettings::default())
    }

    pub fn with_settings(pool: PgPool, settings: LedgerSettings) -> Self {
        Self { pool, settings }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_account(row: PgRow) -> Result<Account> {
        let temporary_capital: Json<Vec<TemporaryCapital>> = row.try_get("temporary_capital")?;
        let recent: Json<RecentOperations> = row.try_get("last_executed_operations")?;

        Ok(Account {
            id: AccountId::new(row.try_get::<String, _>("id")?),
            client_id: ClientId::new(row.try_get::<String, _>("client_id")?),
            trading_condition_id: row.try_get("trading_condition_id")?,
            base_asset_id: row.try_get("base_asset_id")?,
            balance: row.try_get("balance")?,
            withdraw_transfer_limit: row.try_get("withdraw_transfer_limit")?,
            legal_entity: row.try_get("legal_entity")?,
            is_disabled: row.try_get("is_disabled")?,
            is_withdrawal_disabled: row.try_get("is_withdrawal_disabled")?,
            is_deleted: row.try_get("is_deleted")?,
            modification_timestamp: row.try_get("modification_timestamp")?,
            temporary_capital: temporary_capital.0,
            last_executed_operations: recent.0,
        })
    }

    fn row_to_change(row: PgRow) -> Result<AccountBalanceChange> {
        let reason_type: String = row.try_get("reason_type")?;

        Ok(AccountBalanceChange {
            id: OperationId::new(row.try_get::<String, _>("id")?),
            account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
            client_id: ClientId::new(row.try_get::<String, _>("client_id")?),
            change_timestamp: row.try_get("change_timestamp")?,
            change_amount: row.try_get("change_amount")?,
            balance: row.try_get("balance")?,
            withdraw_transfer_limit: row.try_get("withdraw_transfer_limit")?,
            comment: row.try_get("comment")?,
            reason_type: reason_type.parse()?,
            event_source_id: row.try_get("event_source_id")?,
            legal_entity: row.try_get("legal_entity")?,
            audit_log: row.try_get("audit_log")?,
        })
    }

    async fn lock_account(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &AccountId,
    ) -> Result<Account> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(account_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(row) => Self::row_to_account(row),
            None => Err(LedgerError::AccountNotFound(account_id.clone())),
        }
    }

    async fn write_account(tx: &mut Transaction<'_, Postgres>, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2,
                withdraw_transfer_limit = $3,
                is_disabled = $4,
                is_withdrawal_disabled = $5,
                is_deleted = $6,
                modification_timestamp = $7,
                temporary_capital = $8,
                last_executed_operations = $9
            WHERE id = $1
            "#,
        )
        .bind(account.id.as_str())
        .bind(account.balance)
        .bind(account.withdraw_transfer_limit)
        .bind(account.is_disabled)
        .bind(account.is_withdrawal_disabled)
        .bind(account.is_deleted)
        .bind(account.modification_timestamp)
        .bind(Json(&account.temporary_capital))
        .bind(Json(&account.last_executed_operations))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn find_change(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &AccountId,
        operation_id: &OperationId,
    ) -> Result<Option<AccountBalanceChange>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM account_history WHERE account_id = $1 AND id = $2"
        ))
        .bind(account_id.as_str())
        .bind(operation_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_change).transpose()
    }

    async fn insert_change(
        tx: &mut Transaction<'_, Postgres>,
        change: &AccountBalanceChange,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO account_history ({CHANGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(change.id.as_str())
        .bind(change.account_id.as_str())
        .bind(change.client_id.as_str())
        .bind(change.change_timestamp)
        .bind(change.change_amount)
        .bind(change.balance)
        .bind(change.withdraw_transfer_limit)
        .bind(&change.comment)
        .bind(change.reason_type.as_str())
        .bind(&change.event_source_id)
        .bind(&change.legal_entity)
        .bind(&change.audit_log)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn mutate<F>(&self, account_id: &AccountId, f: F) -> Result<Account>
    where
        F: FnOnce(&mut Account) + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut account = Self::lock_account(&mut tx, account_id).await?;
        f(&mut account);
        account.modification_timestamp = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        tx.commit().await?;
        Ok(account)
    }
}

#[async_trait]
impl AccountsRepository for PostgresAccountsRepository {
    async fn add(&self, account: Account) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO NOTHING"
        ))
        .bind(account.id.as_str())
        .bind(account.client_id.as_str())
        .bind(&account.trading_condition_id)
        .bind(&account.base_asset_id)
        .bind(account.balance)
        .bind(account.withdraw_transfer_limit)
        .bind(&account.legal_entity)
        .bind(account.is_disabled)
        .bind(account.is_withdrawal_disabled)
        .bind(account.is_deleted)
        .bind(account.modification_timestamp)
        .bind(Json(&account.temporary_capital))
        .bind(Json(&account.last_executed_operations))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DuplicateAccount(account.id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<Account>> {
        let row: Option<PgRow> =
            sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
                .bind(account_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Self::row_to_account).transpose()
    }

    async fn get_all(&self, filter: &AccountFilter) -> Result<Vec<Account>> {
        let rows: Vec<PgRow> = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE ($1::text IS NULL OR client_id = $1) AND ($2 OR NOT is_deleted) \
             ORDER BY id"
        ))
        .bind(filter.client_id.as_ref().map(|id| id.as_str()))
        .bind(filter.include_deleted)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    #[tracing::instrument(skip(self, update), fields(operation_id = %update.operation_id, account_id = %update.account_id))]
    async fn update_balance(&self, update: BalanceUpdate) -> Result<BalanceUpdateOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut account = Self::lock_account(&mut tx, &update.account_id).await?;

        let previous = Self::find_change(&mut tx, &update.account_id, &update.operation_id).await?;
        if previous.is_some() {
            tx.rollback().await?;
            metrics::counter!("ledger_duplicate_operations_total").increment(1);
            tracing::debug!("operation already applied, balance left unchanged");
            return Ok(BalanceUpdateOutcome {
                account,
                change: previous,
                applied: false,
            });
        }

        if let Err(e) =
            account.admit_balance_update(&update, self.settings.recent_operations_capacity)
        {
            // The refusal is remembered on the row.
            Self::write_account(&mut tx, &account).await?;
            tx.commit().await?;
            metrics::counter!("ledger_refused_operations_total").increment(1);
            tracing::warn!(error = %e, "balance change refused");
            return Err(e);
        }

        let change = account.apply_balance_update(
            &update,
            self.settings.recent_operations_capacity,
            Utc::now(),
        );
        Self::write_account(&mut tx, &account).await?;
        Self::insert_change(&mut tx, &change).await?;
        tx.commit().await?;
        metrics::counter!("ledger_balance_updates_total").increment(1);

        Ok(BalanceUpdateOutcome {
            account,
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
        let reason_types: Option<Vec<String>> = query
            .reason_types
            .as_ref()
            .map(|reasons| reasons.iter().map(|r| r.as_str().to_string()).collect());

        let rows: Vec<PgRow> = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM account_history \
             WHERE account_id = $1 \
               AND ($2::timestamptz IS NULL OR change_timestamp >= $2) \
               AND ($3::timestamptz IS NULL OR change_timestamp < $3) \
               AND ($4::text[] IS NULL OR reason_type = ANY($4)) \
             ORDER BY change_timestamp, id"
        ))
        .bind(query.account_id.as_str())
        .bind(query.from)
        .bind(query.to)
        .bind(reason_types)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_change).collect()
    }
}
