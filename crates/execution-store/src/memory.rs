use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::OperationId;
use tokio::sync::RwLock;

use crate::{
    ExecutionInfoRecord, ExecutionStoreError, Result, Version,
    store::{ExecutionInfoStore, GetOrAdd},
};

type Key = (String, OperationId);

/// In-memory execution-info store.
///
/// Provides the same semantics as the PostgreSQL implementation; the write
/// lock makes insert-if-absent and compare-and-swap atomic.
#[derive(Clone, Default)]
pub struct InMemoryExecutionInfoStore {
    records: Arc<RwLock<HashMap<Key, ExecutionInfoRecord>>>,
}

impl InMemoryExecutionInfoStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionInfoStore for InMemoryExecutionInfoStore {
    async fn get_or_add(&self, mut record: ExecutionInfoRecord) -> Result<GetOrAdd> {
        let key = (record.operation_name.clone(), record.id.clone());
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(&key) {
            return Ok(GetOrAdd {
                record: existing.clone(),
                created: false,
            });
        }

        record.version = Version::first();
        records.insert(key, record.clone());
        Ok(GetOrAdd {
            record,
            created: true,
        })
    }

    async fn get(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<Option<ExecutionInfoRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(operation_name.to_string(), operation_id.clone()))
            .cloned())
    }

    async fn save(&self, mut record: ExecutionInfoRecord, expected: Version) -> Result<Version> {
        let key = (record.operation_name.clone(), record.id.clone());
        let mut records = self.records.write().await;

        let Some(current) = records.get(&key) else {
            return Err(ExecutionStoreError::NotFound {
                operation_name: record.operation_name,
                operation_id: record.id,
            });
        };

        if current.version != expected {
            return Err(ExecutionStoreError::ConcurrencyConflict {
                operation_name: record.operation_name,
                operation_id: record.id,
                expected,
                actual: current.version,
            });
        }

        let new_version = expected.next();
        record.version = new_version;
        records.insert(key, record);
        Ok(new_version)
    }

    async fn delete(&self, operation_name: &str, operation_id: &OperationId) -> Result<()> {
        let mut records = self.records.write().await;
        records.remove(&(operation_name.to_string(), operation_id.clone()));
        Ok(())
    }
}
