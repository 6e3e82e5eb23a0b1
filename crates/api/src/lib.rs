//! HTTP and WebSocket surface for the order workflow.
//!
//! Provides the accept endpoint, status lookup and the real-time push
//! socket, plus the wiring that runs the process and notify consumers
//! alongside the server, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use messaging::{Consumer, InMemoryChannel, MessageChannel, PostgresChannel};
use metrics_exporter_prometheus::PrometheusHandle;
use orders::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};
use sqlx::postgres::PgPoolOptions;
use state_store::{
    CorrelationRegistry, InMemoryTransientStore, PostgresTransientStore, StateStoreError,
    WorkflowStateStore,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use workflow::{
    AcceptStage, Backplane, BackplanePushChannel, BroadcastBackplane, ConnectionHub, NotifyStage,
    PostgresBackplane, ProcessStage, StatusQuery, run_relay,
};

use config::Config;
use error::StartupError;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// The transient store behind both the state store and the registry.
#[derive(Clone)]
pub enum TransientBackend {
    Memory(InMemoryTransientStore),
    Postgres(PostgresTransientStore),
}

impl TransientBackend {
    fn states(&self) -> Arc<dyn WorkflowStateStore> {
        match self {
            TransientBackend::Memory(store) => Arc::new(store.clone()),
            TransientBackend::Postgres(store) => Arc::new(store.clone()),
        }
    }

    fn registry(&self) -> Arc<dyn CorrelationRegistry> {
        match self {
            TransientBackend::Memory(store) => Arc::new(store.clone()),
            TransientBackend::Postgres(store) => Arc::new(store.clone()),
        }
    }

    /// Removes expired keys, returning how many were dropped.
    pub async fn purge_expired(&self) -> Result<u64, StateStoreError> {
        match self {
            TransientBackend::Memory(store) => Ok(store.purge_expired().await as u64),
            TransientBackend::Postgres(store) => store.purge_expired().await,
        }
    }
}

/// Every external collaborator the workflow talks to.
#[derive(Clone)]
pub struct Backends {
    pub transient: TransientBackend,
    pub channel: Arc<dyn MessageChannel>,
    pub orders: Arc<dyn OrderRepository>,
    pub backplane: Arc<dyn Backplane>,
}

impl Backends {
    /// Single-process backends; nothing survives a restart.
    pub fn in_memory(config: &Config) -> Self {
        Self::from_in_memory(
            InMemoryTransientStore::new(config.ttl()),
            InMemoryChannel::new(config.visibility_timeout),
            InMemoryOrderRepository::new(),
        )
    }

    /// Builds in-memory backends from existing handles, so callers keep
    /// access to their test hooks.
    pub fn from_in_memory(
        store: InMemoryTransientStore,
        channel: InMemoryChannel,
        orders: InMemoryOrderRepository,
    ) -> Self {
        Self {
            transient: TransientBackend::Memory(store),
            channel: Arc::new(channel),
            orders: Arc::new(orders),
            backplane: Arc::new(BroadcastBackplane::default()),
        }
    }

    /// Connects to Postgres, runs migrations and builds every backend on the
    /// shared pool.
    pub async fn postgres(config: &Config, url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(config.operation_timeout)
            .connect(url)
            .await?;

        let orders = PostgresOrderRepository::new(pool.clone());
        orders.run_migrations().await?;
        tracing::info!("database migrations applied");

        Ok(Self {
            transient: TransientBackend::Postgres(PostgresTransientStore::new(
                pool.clone(),
                config.ttl(),
            )),
            channel: Arc::new(PostgresChannel::new(pool.clone(), config.visibility_timeout)),
            orders: Arc::new(orders),
            backplane: Arc::new(PostgresBackplane::new(pool)),
        })
    }

    pub fn process_consumer(&self, config: &Config) -> Consumer<dyn MessageChannel, ProcessStage> {
        let stage = ProcessStage::new(
            self.transient.states(),
            self.orders.clone(),
            self.channel.clone(),
            config.operation_timeout,
        );
        Consumer::new(
            self.channel.clone(),
            Arc::new(stage),
            config.consumer_config(config.process_max_attempts),
        )
    }

    pub fn notify_consumer(&self, config: &Config) -> Consumer<dyn MessageChannel, NotifyStage> {
        let stage = NotifyStage::new(
            self.transient.registry(),
            Arc::new(BackplanePushChannel::new(self.backplane.clone())),
            config.operation_timeout,
        );
        Consumer::new(
            self.channel.clone(),
            Arc::new(stage),
            config.consumer_config(config.notify_max_attempts),
        )
    }
}

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub accept: AcceptStage,
    pub status: StatusQuery,
    pub hub: ConnectionHub,
    /// Outbound queue length per push connection.
    pub push_buffer: usize,
}

impl AppState {
    pub fn new(backends: &Backends, hub: ConnectionHub, config: &Config) -> Self {
        Self {
            accept: AcceptStage::new(
                backends.transient.registry(),
                backends.transient.states(),
                backends.channel.clone(),
                config.operation_timeout,
            ),
            status: StatusQuery::new(
                backends.transient.states(),
                backends.orders.clone(),
                config.operation_timeout,
            ),
            hub,
            push_buffer: 32,
        }
    }
}

/// Background tasks running next to the HTTP server.
pub struct Workers {
    tasks: JoinSet<()>,
}

impl Workers {
    /// Starts the stage consumers, the push relay and the expiry sweep. All of
    /// them stop once `shutdown` flips to `true`.
    pub fn spawn(
        backends: &Backends,
        hub: ConnectionHub,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut tasks = JoinSet::new();

        tasks.spawn(backends.process_consumer(config).run(shutdown.clone()));
        tasks.spawn(backends.notify_consumer(config).run(shutdown.clone()));

        tasks.spawn(run_relay(backends.backplane.clone(), hub, shutdown.clone()));

        tasks.spawn(purge_loop(backends.transient.clone(), shutdown));

        Self { tasks }
    }

    /// Waits for every task to finish draining.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "background task panicked");
            }
        }
    }
}

async fn purge_loop(transient: TransientBackend, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => match transient.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired transient keys purged"),
                Err(e) => tracing::warn!(error = %e, "failed to purge transient keys"),
            },
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health))
        .route("/orders", post(routes::orders::accept))
        .route(
            "/orders/status/{correlation_id}",
            get(routes::orders::status),
        )
        .route("/ws", get(routes::push::connect))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
