use async_trait::async_trait;
use common::OperationId;

use crate::{ExecutionInfoRecord, Result, Version};

/// Outcome of an insert-if-absent call.
#[derive(Debug, Clone)]
pub struct GetOrAdd {
    /// The stored record (freshly inserted or pre-existing).
    pub record: ExecutionInfoRecord,

    /// True if this call inserted the record.
    pub created: bool,
}

/// Core trait for execution-info store implementations.
///
/// One record exists per `(operation_name, id)`. All implementations must be
/// thread-safe and must make [`ExecutionInfoStore::get_or_add`] atomic: two
/// racing callers for the same key observe the same record and exactly one of
/// them sees `created == true`.
#[async_trait]
pub trait ExecutionInfoStore: Send + Sync {
    /// Inserts `record` unless a record with the same key exists.
    ///
    /// The inserted record gets [`Version::first`] regardless of the version
    /// carried by the argument.
    async fn get_or_add(&self, record: ExecutionInfoRecord) -> Result<GetOrAdd>;

    /// Loads a record by key.
    async fn get(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<Option<ExecutionInfoRecord>>;

    /// Overwrites a record if it is still at `expected`.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version differs and with
    /// `NotFound` if the record is gone. Returns the new version.
    async fn save(&self, record: ExecutionInfoRecord, expected: Version) -> Result<Version>;

    /// Removes a record. Deleting a missing record is not an error.
    async fn delete(&self, operation_name: &str, operation_id: &OperationId) -> Result<()>;
}
