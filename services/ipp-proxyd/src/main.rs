//! IP protection proxy session daemon
//!
//! Single-binary service that:
//! 1. Loads config and the guardian bearer token
//! 2. Builds the proxy session manager over the guardian HTTP client and the
//!    usage cache
//! 3. Keeps usage fresh in the background and optionally activates at boot
//! 4. Serves health, metrics and session control over HTTP
//! 5. Stops the session on SIGINT/SIGTERM

mod config;
mod control;
mod metrics;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use guardian::{FileUsageCache, GuardianClient, MemoryUsageCache, UsageCache};
use proxy_session::{ProxySessionManager, spawn_usage_refresh_task};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::control::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ipp-proxyd");

    // Installed before the manager exists so its initial gauges are recorded
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        guardian = %config.guardian.base_url,
        listen_addr = %config.admin.listen_addr,
        cache_enabled = config.cache.enabled,
        autostart = config.session.autostart,
        "configuration loaded"
    );

    let auth_token = config
        .guardian
        .auth_token
        .take()
        .context("guardian token missing after config load")?;
    let client = GuardianClient::new(reqwest::Client::new(), &config.guardian.base_url, auth_token);

    let cache: Arc<dyn UsageCache> = if config.cache.enabled {
        info!(path = %config.cache.path.display(), "usage cache enabled");
        Arc::new(FileUsageCache::new(config.cache.path.clone()))
    } else {
        info!("usage cache disabled, usage kept in memory only");
        Arc::new(MemoryUsageCache::new())
    };

    let manager = ProxySessionManager::builder(Arc::new(client), cache)
        .config(config.manager_config())
        .build()
        .await
        .context("failed to build session manager")?;

    let refresh = spawn_usage_refresh_task(manager.clone(), config.usage_refresh_interval());

    if config.session.autostart {
        let state = manager.start().await;
        info!(state = state.label(), "autostart finished");
    } else {
        let state = manager.refresh_usage().await;
        info!(state = state.label(), "initial usage check finished");
    }

    let app = build_router(
        AppState {
            manager: manager.clone(),
            prometheus,
            started_at: Instant::now(),
        },
        config.admin.max_connections,
    );

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting control requests");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    refresh.abort();
    let state = manager.stop().await;
    info!(state = state.label(), "session stopped");

    if let Err(e) = served {
        error!(error = %e, "server error during shutdown");
        return Err(e).context("control server failed");
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that cannot be installed is logged and never fires; the other
/// signal still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
