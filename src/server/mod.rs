//! HTTP service: routing endpoint plus registry, health and event views.

mod handlers;

pub use handlers::{
    CACHEWISE_CACHE_HEADER, CACHEWISE_COST_HEADER, CACHEWISE_DEDUP_HEADER,
    CACHEWISE_LATENCY_MS_HEADER, CACHEWISE_MODEL_HEADER, CACHEWISE_REQUEST_ID_HEADER,
    CACHEWISE_RETRIES_HEADER,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::provider::http::HttpProvider;
use crate::provider::ProviderPool;
use crate::reload::{ConfigWatcher, DEFAULT_DEBOUNCE};
use crate::router::Router as CostRouter;
use crate::sink::{FanoutSink, MemorySink, TracingSink};
use crate::storage::{init_pool, SqliteSink};

/// Events kept in memory for `GET /v1/events`.
const RECENT_EVENTS: usize = 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub router: CostRouter,
    /// Most recent cost events, also fed by the router's sink
    pub recent: MemorySink,
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/route", post(handlers::route))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/events", get(handlers::recent_events))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build one [`HttpProvider`] per configured provider.
pub fn provider_pool(config: &Config, client: &Client) -> ProviderPool {
    let mut pool = ProviderPool::new();
    for provider in &config.providers {
        let http = HttpProvider::new(provider, client.clone());
        pool.insert(http.name().to_string(), Arc::new(http));
    }
    pool
}

/// Run the HTTP server until ctrl-c.
///
/// With `config_path` set, edits to that file are applied while running.
pub async fn run_server(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    // Per-call deadlines come from each provider's timeout_ms
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let recent = MemorySink::new(RECENT_EVENTS);
    let mut sinks = FanoutSink::default();
    sinks.push(Arc::new(recent.clone()));
    if config.logging.log_events {
        sinks.push(Arc::new(TracingSink));
    }
    if let Some(db) = &config.database {
        let pool = init_pool(&db.path).await?;
        tracing::info!(path = %db.path, "Recording cost events to SQLite");
        sinks.push(Arc::new(SqliteSink::new(pool)));
    }
    tracing::debug!(sinks = sinks.len(), "Cost event sinks ready");

    let providers = provider_pool(&config, &http_client);
    tracing::info!(providers = ?providers.names(), "Provider pool ready");

    let router = CostRouter::from_config(
        &config,
        Arc::new(providers),
        Arc::new(sinks),
    )?;
    let _maintenance = router.spawn_maintenance(config.dedup.sweep_interval());

    let _watcher = match config_path {
        Some(path) => Some(ConfigWatcher::spawn(path, router.clone(), DEFAULT_DEBOUNCE)?),
        None => None,
    };

    let app = create_router(AppState { router, recent }).layer(ConcurrencyLimitLayer::new(
        config.server.max_concurrent_requests,
    ));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting cachewise server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
