//! Persistence of saga execution info.
//!
//! One record per `(operation type, operation id)` holds a saga's current
//! state and payload. Records are created with an atomic insert-if-absent and
//! updated with compare-and-swap on a row version, so two handlers racing on
//! the same operation can never silently overwrite each other.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod repository;
pub mod store;

pub use common::OperationId;
pub use error::{ExecutionStoreError, Result};
pub use memory::InMemoryExecutionInfoStore;
pub use postgres::PostgresExecutionInfoStore;
pub use record::{ExecutionInfoRecord, OperationExecutionInfo, Version};
pub use repository::ExecutionInfoRepository;
pub use store::{ExecutionInfoStore, GetOrAdd};
