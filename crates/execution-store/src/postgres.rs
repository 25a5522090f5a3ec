use async_trait::async_trait;
use common::OperationId;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    ExecutionInfoRecord, ExecutionStoreError, Result, Version,
    store::{ExecutionInfoStore, GetOrAdd},
};

/// PostgreSQL-backed execution-info store.
///
/// Records live in `operation_execution_info`, keyed by
/// `(operation_name, id)`. Saves are conditional updates on the `version`
/// column.
#[derive(Clone)]
pub struct PostgresExecutionInfoStore {
    pool: PgPool,
}

impl PostgresExecutionInfoStore {
    /// Creates a new PostgreSQL execution-info store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<ExecutionInfoRecord> {
        Ok(ExecutionInfoRecord {
            operation_name: row.try_get("operation_name")?,
            id: OperationId::new(row.try_get::<String, _>("id")?),
            last_modified: row.try_get("last_modified")?,
            version: Version::new(row.try_get("version")?),
            data: row.try_get("data")?,
        })
    }

    async fn current_version(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<Option<Version>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM operation_execution_info WHERE operation_name = $1 AND id = $2",
        )
        .bind(operation_name)
        .bind(operation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(Version::new))
    }
}

#[async_trait]
impl ExecutionInfoStore for PostgresExecutionInfoStore {
    async fn get_or_add(&self, record: ExecutionInfoRecord) -> Result<GetOrAdd> {
        let inserted: Option<PgRow> = sqlx::query(
            r#"
            INSERT INTO operation_execution_info (operation_name, id, last_modified, version, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (operation_name, id) DO NOTHING
            RETURNING operation_name, id, last_modified, version, data
            "#,
        )
        .bind(&record.operation_name)
        .bind(record.id.as_str())
        .bind(record.last_modified)
        .bind(Version::first().as_i64())
        .bind(&record.data)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(GetOrAdd {
                record: Self::row_to_record(row)?,
                created: true,
            });
        }

        let existing = self
            .get(&record.operation_name, &record.id)
            .await?
            .ok_or_else(|| ExecutionStoreError::NotFound {
                operation_name: record.operation_name.clone(),
                operation_id: record.id.clone(),
            })?;

        Ok(GetOrAdd {
            record: existing,
            created: false,
        })
    }

    async fn get(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<Option<ExecutionInfoRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT operation_name, id, last_modified, version, data
            FROM operation_execution_info
            WHERE operation_name = $1 AND id = $2
            "#,
        )
        .bind(operation_name)
        .bind(operation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn save(&self, record: ExecutionInfoRecord, expected: Version) -> Result<Version> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE operation_execution_info
            SET data = $3, last_modified = $4, version = version + 1
            WHERE operation_name = $1 AND id = $2 AND version = $5
            RETURNING version
            "#,
        )
        .bind(&record.operation_name)
        .bind(record.id.as_str())
        .bind(&record.data)
        .bind(record.last_modified)
        .bind(expected.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = updated {
            return Ok(Version::new(version));
        }

        match self.current_version(&record.operation_name, &record.id).await? {
            Some(actual) => Err(ExecutionStoreError::ConcurrencyConflict {
                operation_name: record.operation_name,
                operation_id: record.id,
                expected,
                actual,
            }),
            None => Err(ExecutionStoreError::NotFound {
                operation_name: record.operation_name,
                operation_id: record.id,
            }),
        }
    }

    async fn delete(&self, operation_name: &str, operation_id: &OperationId) -> Result<()> {
        sqlx::query("DELETE FROM operation_execution_info WHERE operation_name = $1 AND id = $2")
            .bind(operation_name)
            .bind(operation_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
