use chrono::{DateTime, Utc};
use common::OperationId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Row version of an execution-info record, used for compare-and-swap saves.
///
/// A freshly inserted record is at [`Version::first`]; every successful save
/// increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a record that does not exist.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version assigned on insert.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Untyped execution-info row as the store persists it.
///
/// Keyed by `(operation_name, id)`. The saga-specific payload is kept as
/// JSON so a single table can back every saga type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfoRecord {
    /// Operation type, e.g. `"Withdraw"`.
    pub operation_name: String,

    /// Operation id, unique per operation type.
    pub id: OperationId,

    /// When the record was last written.
    pub last_modified: DateTime<Utc>,

    /// Row version for optimistic concurrency.
    pub version: Version,

    /// Saga-specific payload.
    pub data: serde_json::Value,
}

/// Typed execution info backing one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationExecutionInfo<D> {
    pub operation_name: String,
    pub id: OperationId,
    pub last_modified: DateTime<Utc>,
    pub data: D,
    version: Version,
}

impl<D> OperationExecutionInfo<D> {
    /// Creates a new, not yet persisted, execution info.
    pub fn new(operation_name: impl Into<String>, id: OperationId, data: D) -> Self {
        Self {
            operation_name: operation_name.into(),
            id,
            last_modified: Utc::now(),
            data,
            version: Version::initial(),
        }
    }

    /// The version this value was loaded at.
    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

impl<D: Serialize> OperationExecutionInfo<D> {
    pub(crate) fn to_record(&self) -> serde_json::Result<ExecutionInfoRecord> {
        Ok(ExecutionInfoRecord {
            operation_name: self.operation_name.clone(),
            id: self.id.clone(),
            last_modified: self.last_modified,
            version: self.version,
            data: serde_json::to_value(&self.data)?,
        })
    }
}

impl<D: DeserializeOwned> OperationExecutionInfo<D> {
    pub(crate) fn from_record(record: ExecutionInfoRecord) -> serde_json::Result<Self> {
        Ok(Self {
            operation_name: record.operation_name,
            id: record.id,
            last_modified: record.last_modified,
            data: serde_json::from_value(record.data)?,
            version: record.version,
        })
    }
}
