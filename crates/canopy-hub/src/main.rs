//! # canopy-hub
//!
//! Relay server for canopy.
//!
//! This binary provides:
//! - The WebSocket hub that devices and viewers connect to
//! - Read-only REST endpoints and OpenAPI documentation
//! - History persistence across restarts
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package canopy-hub
//!
//! # Production
//! CANOPY_ENV=production ./canopy-hub
//! ```
//!
//! Configuration is read from `CANOPY_CONFIG` or the platform config
//! directory, with `CANOPY_<SECTION>__<KEY>` overrides.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use canopy_core::CanopyConfig;
use canopy_hub::{create_router, logging, persistence, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!("Starting canopy-hub");

    let config = CanopyConfig::load(None).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let hub_config = config.hub;

    let addr: SocketAddr = hub_config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", hub_config.bind_address))?;

    let state = AppState::new(hub_config);
    let restored = persistence::load(&state).await;
    info!(
        entries = restored,
        path = %state.store().path().display(),
        "History loaded"
    );

    let shutdown = CancellationToken::new();
    let saver = persistence::spawn_periodic_save(state.clone(), shutdown.clone());

    let app = create_router(state.clone());
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        address = %addr,
        ws_path = %state.config().ws_path,
        "Listening"
    );

    let signal_token = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        signal_token.cancel();
    })
    .await?;

    shutdown.cancel();
    let _ = saver.await;

    match persistence::save_now(&state).await {
        Ok(()) => info!("History saved on shutdown"),
        Err(e) => error!(error = %e, "Failed to save history on shutdown"),
    }

    info!("canopy-hub stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            error!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating shutdown...");
        }
    }
}
