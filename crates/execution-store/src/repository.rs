//! Typed access to execution-info records.

use std::sync::Arc;

use chrono::Utc;
use common::OperationId;
use serde::{Serialize, de::DeserializeOwned};

use crate::store::ExecutionInfoStore;
use crate::{OperationExecutionInfo, Result};

/// Typed facade over an [`ExecutionInfoStore`].
///
/// Converts saga payloads to and from JSON and threads the row version
/// through loads and saves, so a save only succeeds if nobody else wrote
/// the record since it was loaded.
#[derive(Clone)]
pub struct ExecutionInfoRepository {
    store: Arc<dyn ExecutionInfoStore>,
}

impl ExecutionInfoRepository {
    /// Creates a repository over the given store.
    pub fn new(store: impl ExecutionInfoStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Creates a repository over a shared store.
    pub fn from_arc(store: Arc<dyn ExecutionInfoStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn ExecutionInfoStore> {
        &self.store
    }

    /// Loads the record for `(operation_name, id)`, creating it with
    /// `factory()` if absent.
    ///
    /// Returns the record and whether this call created it.
    #[tracing::instrument(skip(self, factory))]
    pub async fn get_or_add<D, F>(
        &self,
        operation_name: &str,
        id: &OperationId,
        factory: F,
    ) -> Result<(OperationExecutionInfo<D>, bool)>
    where
        D: Serialize + DeserializeOwned,
        F: FnOnce() -> D,
    {
        let fresh = OperationExecutionInfo::new(operation_name, id.clone(), factory());
        let outcome = self.store.get_or_add(fresh.to_record()?).await?;
        if outcome.created {
            metrics::counter!("execution_info_created_total").increment(1);
        }
        let info = OperationExecutionInfo::from_record(outcome.record)?;
        Ok((info, outcome.created))
    }

    /// Loads a record, returning None if it does not exist.
    pub async fn get<D>(
        &self,
        operation_name: &str,
        id: &OperationId,
    ) -> Result<Option<OperationExecutionInfo<D>>>
    where
        D: DeserializeOwned,
    {
        match self.store.get(operation_name, id).await? {
            Some(record) => Ok(Some(OperationExecutionInfo::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Loads a record as raw JSON.
    pub async fn get_raw(
        &self,
        operation_name: &str,
        id: &OperationId,
    ) -> Result<Option<crate::ExecutionInfoRecord>> {
        self.store.get(operation_name, id).await
    }

    /// Persists `info` if the stored record is still at the version `info`
    /// was loaded at. On success `info` carries the new version.
    #[tracing::instrument(skip(self, info), fields(operation_name = %info.operation_name, operation_id = %info.id))]
    pub async fn save<D>(&self, info: &mut OperationExecutionInfo<D>) -> Result<()>
    where
        D: Serialize,
    {
        info.last_modified = Utc::now();
        let record = info.to_record()?;
        let version = self.store.save(record, info.version()).await?;
        info.set_version(version);
        Ok(())
    }

    /// Deletes the record backing `info`.
    pub async fn delete<D>(&self, info: &OperationExecutionInfo<D>) -> Result<()> {
        self.store.delete(&info.operation_name, &info.id).await
    }
}
