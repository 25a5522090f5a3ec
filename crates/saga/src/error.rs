//! Saga error types.

use common::OperationId;
use execution_store::ExecutionStoreError;
use ledger::LedgerError;
use thiserror::Error;

use crate::trading_engine::TradingEngineError;

/// Errors that can occur while handling commands and events.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The message arrived before the saga reached the state it reacts to.
    #[error("Saga state not reached: expected {expected}, actual {actual}")]
    StateNotReached { expected: String, actual: String },

    /// No execution info exists for the operation.
    #[error("Execution info not found: {operation_name}/{operation_id}")]
    ExecutionInfoNotFound {
        operation_name: String,
        operation_id: OperationId,
    },

    /// A compensating step did not go through and must be retried.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// Execution-info store error.
    #[error("Execution store error: {0}")]
    ExecutionStore(#[from] ExecutionStoreError),

    /// Ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Trading engine error.
    #[error("Trading engine error: {0}")]
    TradingEngine(#[from] TradingEngineError),

    /// The message bus rejected a message.
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A request was rejected before any message was sent.
    #[error("Invalid request: {0}")]
    Validation(String),
}

impl SagaError {
    /// Returns true if redelivering the message later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::StateNotReached { .. }
            | SagaError::ExecutionInfoNotFound { .. }
            | SagaError::CompensationFailed { .. }
            | SagaError::Bus(_) => true,
            SagaError::ExecutionStore(e) => e.is_transient(),
            SagaError::Ledger(e) => e.is_transient(),
            SagaError::TradingEngine(e) => e.is_retryable(),
            SagaError::Serialization(_) | SagaError::Validation(_) => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
