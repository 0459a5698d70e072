use std::future::IntoFuture;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dispatch_relay::api;
use dispatch_relay::config::Config;
use dispatch_relay::error::AppError;
use dispatch_relay::state::AppState;
use dispatch_relay::store::Backend;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let backend = Backend::connect(&config).await?;
    info!(backend = ?config.store_backend, "store ready");

    let app_state = AppState::new(&config, backend.key_value(), backend.event_bus());
    let shared_state = Arc::new(app_state);

    let bridge_task = shared_state.start_bridge().await?;

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    info!(http_port = config.http_port, "http server started");

    let stopping = Arc::new(Notify::new());
    let registry = shared_state.registry.clone();
    let grace = config.shutdown_grace;

    let server = axum::serve(listener, app)
        .with_graceful_shutdown({
            let stopping = stopping.clone();
            async move {
                shutdown_signal().await;
                info!("shutting down");
                stopping.notify_one();

                match tokio::time::timeout(grace, registry.close_all()).await {
                    Ok(closed) => info!(closed, "closed live connections"),
                    Err(_) => warn!("timed out closing live connections"),
                }
            }
        })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::Internal(format!("server error: {err}")))?;
        }
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("grace period elapsed; abandoning open requests");
        }
    }

    bridge_task.abort();
    if tokio::time::timeout(grace, backend.close()).await.is_err() {
        warn!("timed out closing store client");
    }

    info!("server exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
