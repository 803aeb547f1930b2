//! Listsync daemon
//!
//! Runs the sync core against a remote store, draining whatever the local
//! queue holds and logging sync events until interrupted.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use listsync::db::create_pool;
use listsync::{Config, HttpRemote, SyncContext, SyncEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "listsync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("failed to load configuration")?;

    tracing::info!("Starting listsync against {}", config.remote.url);

    let pool = create_pool(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;

    let remote = Arc::new(HttpRemote::new(&config.remote)?);
    let ctx = SyncContext::builder(pool, remote.clone(), remote)
        .config(config.sync.clone())
        .build();

    let mut events = ctx.subscribe();
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                SyncEvent::OperationFailed { operation, error } => {
                    tracing::warn!("Operation {} failed: {}", operation.id, error);
                }
                other => match serde_json::to_string(other) {
                    Ok(json) => tracing::debug!("event {}", json),
                    Err(e) => tracing::debug!("Unserializable event: {}", e),
                },
            }
        }
    });

    ctx.start().await.context("failed to start sync context")?;
    ctx.on_connectivity_change(true).await;

    let status = ctx.status().await?;
    tracing::info!(
        "Sync {} ({} pending, {} failed, remote {})",
        status.state.as_str(),
        status.pending_changes,
        status.failed_changes,
        if status.reachable { "reachable" } else { "unreachable" }
    );

    shutdown_signal().await;

    ctx.shutdown().await;
    logger.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
