//! Host process for the account ledger engine.
//!
//! Wires the stores, the trading engine and the message bus into a saga
//! engine, runs the message workers, and serves health, metrics and
//! read-only status routes.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use execution_store::{
    ExecutionInfoRepository, InMemoryExecutionInfoStore, PostgresExecutionInfoStore,
};
use ledger::{AccountsRepository, InMemoryAccountsRepository, PostgresAccountsRepository};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    AccountsService, Dispatcher, InMemoryMessageBus, InMemoryTradingEngine, MessagePump,
    SagaContext,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub service: AccountsService,
    pub bus: InMemoryMessageBus,
    pub metrics: PrometheusHandle,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .route("/accounts/{id}", get(routes::status::account))
        .route(
            "/accounts/{id}/balance-changes",
            get(routes::status::balance_changes),
        )
        .route("/operations/{name}/{id}", get(routes::status::operation))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// A wired saga engine: the public facade plus the pump that drives it.
#[derive(Clone)]
pub struct Engine {
    pub service: AccountsService,
    pub bus: InMemoryMessageBus,
    pub trading_engine: InMemoryTradingEngine,
    pub pump: MessagePump,
}

impl Engine {
    /// Engine over in-memory stores. State is lost on restart.
    pub fn in_memory(config: &Config) -> Self {
        Self::assemble(
            config,
            ExecutionInfoRepository::new(InMemoryExecutionInfoStore::new()),
            Arc::new(InMemoryAccountsRepository::with_settings(
                config.ledger_settings(),
            )),
        )
    }

    /// Engine over PostgreSQL stores. Runs pending migrations first.
    pub async fn postgres(config: &Config, database_url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.worker_count as u32 * 2 + 2)
            .connect(database_url)
            .await?;

        let accounts =
            PostgresAccountsRepository::with_settings(pool.clone(), config.ledger_settings());
        accounts.run_migrations().await?;
        tracing::info!("database migrations applied");

        Ok(Self::assemble(
            config,
            ExecutionInfoRepository::new(PostgresExecutionInfoStore::new(pool)),
            Arc::new(accounts),
        ))
    }

    /// Builds an engine from `config`, using PostgreSQL when a database URL
    /// is configured.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        match config.database_url {
            Some(ref url) => Self::postgres(config, url).await,
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory stores");
                Ok(Self::in_memory(config))
            }
        }
    }

    fn assemble(
        config: &Config,
        executions: ExecutionInfoRepository,
        accounts: Arc<dyn AccountsRepository>,
    ) -> Self {
        let bus = InMemoryMessageBus::new();
        // No remote trading engine client exists yet; the in-memory engine
        // accepts every request.
        let trading_engine = InMemoryTradingEngine::new();
        let ctx = SagaContext::new(
            executions,
            accounts,
            Arc::new(trading_engine.clone()),
            Arc::new(bus.clone()),
        );
        let pump = MessagePump::new(
            Dispatcher::new(ctx.clone()),
            bus.clone(),
            config.retry_policy(),
        );

        Self {
            service: AccountsService::new(ctx),
            bus,
            trading_engine,
            pump,
        }
    }

    /// HTTP state for this engine.
    pub fn app_state(&self, metrics: PrometheusHandle) -> Arc<AppState> {
        Arc::new(AppState {
            service: self.service.clone(),
            bus: self.bus.clone(),
            metrics,
        })
    }
}
