//! PostgreSQL integration tests
//!
//! These tests start a PostgreSQL container and therefore need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p execution-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use execution_store::{
    ExecutionInfoRecord, ExecutionInfoRepository, ExecutionInfoStore, ExecutionStoreError,
    OperationExecutionInfo, OperationId, PostgresExecutionInfoStore, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresExecutionInfoStore::new(pool.clone())
                .run_migrations()
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresExecutionInfoStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE operation_execution_info")
        .execute(&pool)
        .await
        .unwrap();

    PostgresExecutionInfoStore::new(pool)
}

fn create_test_record(id: &str, state: &str) -> ExecutionInfoRecord {
    ExecutionInfoRecord {
        operation_name: "Withdraw".to_string(),
        id: OperationId::new(id),
        last_modified: Utc::now(),
        version: Version::initial(),
        data: serde_json::json!({ "state": state }),
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn get_or_add_is_insert_if_absent() {
    let store = get_test_store().await;

    let first = store
        .get_or_add(create_test_record("op-1", "Created"))
        .await
        .unwrap();
    assert!(first.created);
    assert_eq!(first.record.version, Version::first());

    let second = store
        .get_or_add(create_test_record("op-1", "Failed"))
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.record.data["state"], "Created");
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn save_is_compare_and_swap() {
    let store = get_test_store().await;
    let added = store
        .get_or_add(create_test_record("op-1", "Created"))
        .await
        .unwrap();

    let mut record = added.record.clone();
    record.data = serde_json::json!({ "state": "FreezingAmount" });
    let version = store.save(record, Version::first()).await.unwrap();
    assert_eq!(version, Version::new(2));

    let stale = store.save(added.record, Version::first()).await;
    assert!(matches!(
        stale,
        Err(ExecutionStoreError::ConcurrencyConflict { actual, .. }) if actual == Version::new(2)
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn typed_repository_round_trip_and_delete() {
    let store = get_test_store().await;
    let repo = ExecutionInfoRepository::new(store);
    let id = OperationId::new("op-1");

    let (mut info, created) = repo
        .get_or_add("Withdraw", &id, || serde_json::json!({ "state": 0 }))
        .await
        .unwrap();
    assert!(created);

    info.data = serde_json::json!({ "state": 1 });
    repo.save(&mut info).await.unwrap();

    let loaded: OperationExecutionInfo<serde_json::Value> =
        repo.get("Withdraw", &id).await.unwrap().unwrap();
    assert_eq!(loaded.data["state"], 1);
    assert_eq!(loaded.version(), Version::new(2));

    repo.delete(&loaded).await.unwrap();
    let gone: Option<OperationExecutionInfo<serde_json::Value>> =
        repo.get("Withdraw", &id).await.unwrap();
    assert!(gone.is_none());
}
