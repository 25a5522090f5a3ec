use std::sync::Arc;

use common::OperationId;
use execution_store::{ExecutionInfoRepository, OperationExecutionInfo};
use ledger::AccountsRepository;
use serde::de::DeserializeOwned;

use crate::bus::MessageBus;
use crate::error::{Result, SagaError};
use crate::messages::{Command, Event};
use crate::trading_engine::TradingEngine;

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct SagaContext {
    pub executions: ExecutionInfoRepository,
    pub accounts: Arc<dyn AccountsRepository>,
    pub trading_engine: Arc<dyn TradingEngine>,
    pub bus: Arc<dyn MessageBus>,
}

impl SagaContext {
    pub fn new(
        executions: ExecutionInfoRepository,
        accounts: Arc<dyn AccountsRepository>,
        trading_engine: Arc<dyn TradingEngine>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            executions,
            accounts,
            trading_engine,
            bus,
        }
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.bus.send(command).await
    }

    pub async fn publish(&self, event: Event) -> Result<()> {
        self.bus.publish(event).await
    }

    /// Loads execution info that must already exist.
    ///
    /// A missing record means the creating command has not been handled yet,
    /// which is reported as a retryable error.
    pub async fn load<D>(
        &self,
        operation_name: &str,
        operation_id: &OperationId,
    ) -> Result<OperationExecutionInfo<D>>
    where
        D: DeserializeOwned,
    {
        self.executions
            .get(operation_name, operation_id)
            .await?
            .ok_or_else(|| SagaError::ExecutionInfoNotFound {
                operation_name: operation_name.to_string(),
                operation_id: operation_id.clone(),
            })
    }
}
