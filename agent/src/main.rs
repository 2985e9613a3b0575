//! Ferry Agent - offline-first sync agent.
//!
//! Runs the sync engine against durable SQLite storage and an HTTP remote API,
//! and exposes a local HTTP/WebSocket control surface for the UI.

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod remote;
mod routes;
mod websocket;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::db::{
    Pool, SqliteConflictLog, SqliteLocalStore, SqliteOperationStore, SqliteWriteThrough,
};
use crate::remote::{HttpRemote, Probe};
use crate::websocket::ConnectionManager;
use axum::Router;
use ferry_engine::{
    Collaborators, ReachabilitySignal, RemoteApi, Schema, SyncEngine, SystemClock,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub engine: Arc<SyncEngine>,
    pub conn_manager: Arc<ConnectionManager>,
}

/// Wire the engine to the SQLite stores and the given remote.
pub fn build_engine(
    pool: &Pool,
    config: &Config,
    remote: Arc<dyn RemoteApi>,
    reachability: Arc<ReachabilitySignal>,
) -> ferry_engine::Result<SyncEngine> {
    SyncEngine::new(
        Collaborators {
            store: Arc::new(SqliteOperationStore::new(pool.clone())),
            local: Arc::new(SqliteLocalStore::new(pool.clone())),
            remote,
            conflicts: Arc::new(SqliteConflictLog::new(pool.clone())),
            reachability,
            comparator: Arc::new(Schema::standard()),
            clock: Arc::new(SystemClock),
            write_through: Some(Arc::new(SqliteWriteThrough::new(pool.clone()))),
        },
        config.sync.clone(),
    )
}

/// Build the control API router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ferry_agent=debug,ferry_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        remote = %config.remote_base_url,
        "Starting Ferry Agent on {}:{}",
        config.host,
        config.port
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Remote collaborators
    let reachability = Arc::new(ReachabilitySignal::new(false));
    let remote = Arc::new(HttpRemote::new(
        config.remote_base_url.clone(),
        config.remote_token.clone(),
        config.remote_timeout,
    )?);
    let probe = Probe::new(
        &config.remote_base_url,
        config.remote_timeout,
        reachability.clone(),
    )?;
    probe.check().await;
    let (stop_probe, probe_task) = probe.spawn(config.probe_interval);

    // Engine and event relay
    let engine = Arc::new(build_engine(&pool, &config, remote, reachability)?);
    let conn_manager = ConnectionManager::new_shared();
    let relay = websocket::spawn_relay(engine.subscribe(), conn_manager.clone());
    engine.start().await?;

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        engine: engine.clone(),
        conn_manager,
    };

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let an in-flight drain finish before exiting
    engine.stop().await;
    let _ = stop_probe.send(());
    let _ = probe_task.await;
    relay.abort();

    tracing::info!("Ferry Agent stopped");
    Ok(())
}
