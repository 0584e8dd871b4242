//! The Small Sync - authoritative store for offline POS terminals.
//!
//! Terminals operate on local data and later push records (sales, shifts,
//! expenses, ...) identified by client-generated global ids. This crate
//! resolves those ids to server surrogate keys, applies each record exactly
//! once, and lets terminals verify which of their "synced" records really
//! exist server-side.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod diagnostics;
pub mod entities;
pub mod error;
pub mod identity;
pub mod notify;
pub mod policy;
pub mod rate_limit;
pub mod record;
pub mod resolver;
pub mod server;
pub mod upsert;
pub mod verifier;

pub use config::ServerConfig;
pub use coordinator::{BatchReport, RecordResult, RecordStatus, SyncEngine, SyncLimits};
pub use entities::EntityKind;
pub use error::{SyncError, SyncResult};
pub use identity::RequestIdentity;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the rate limiter drops stale entries.
const RATE_LIMIT_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Start the sync server and block until Ctrl-C.
pub fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid sync server configuration")?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_sync_lib=debug"));

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("create log dir {}", config.log_dir.display()))?;
    diagnostics::prune_old_logs(&config.log_dir, diagnostics::MAX_LOG_FILES);

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        "Starting The Small Sync"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    // `_guard` flushes the file log when run() returns.
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let db = {
        let data_dir = config.data_dir.clone();
        let connections = config.db_connections;
        tokio::task::spawn_blocking(move || db::init(&data_dir, connections))
            .await
            .context("store init task")??
    };

    let engine = Arc::new(SyncEngine::new(
        Arc::new(db),
        Arc::new(notify::LogNotifier),
        config.limits,
    ));
    let limiter = Arc::new(rate_limit::RateLimiter::new(config.rate_limit));
    let identity = Arc::new(identity::GatewayHeaders::new(config.gateway_secret.clone()));
    if config.gateway_secret.is_none() {
        tracing::warn!("SYNC_GATEWAY_SECRET not set, identity headers are trusted as-is");
    }

    let cancel = CancellationToken::new();
    let reaper = limiter.spawn_reaper(RATE_LIMIT_SWEEP_EVERY, cancel.clone());

    let app = server::build_router(server::AppState::new(engine, identity, limiter));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!("Sync server listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    cancel.cancel();
    let _ = reaper.await;
    info!("Sync server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
