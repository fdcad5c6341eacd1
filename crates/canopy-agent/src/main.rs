//! # canopy-agent
//!
//! Device-side process for canopy. Runs one of:
//! - **edge**: drives the lidar and height sensor and streams telemetry
//! - **bridge**: relays control commands to the Bluetooth actuator
//!
//! # Environment Variables
//!
//! - `CANOPY_AGENT_MODE`: Optional. `edge` or `bridge` (default: edge)
//! - `CANOPY_CONFIG`: Optional. Path to the TOML configuration file
//! - `CANOPY_<SECTION>__<KEY>`: Optional. Per-key configuration overrides
//! - `RUST_LOG` / `CANOPY_LOG_LEVEL`: Optional. Logging level (default: info)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use canopy_agent::ports::locate_actuator;
use canopy_agent::{AgentMode, SerialLineConnector, SerialPorts, WsConnector};
use canopy_core::{
    run_bridge, run_edge, ActuatorBridge, ActuatorLink, BridgeSettings, CanopyConfig,
    EdgeController, EdgeSettings, LinkSession, ReconnectPolicy,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let mode = AgentMode::from_env()?;
    info!(%mode, "canopy-agent starting");

    let config = CanopyConfig::load(None).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let policy = ReconnectPolicy::from(&config.link);
    match mode {
        AgentMode::Edge => run_edge_mode(&config, policy, shutdown).await?,
        AgentMode::Bridge => run_bridge_mode(&config, policy, shutdown).await?,
    }

    info!("canopy-agent stopped");
    Ok(())
}

async fn run_edge_mode(
    config: &CanopyConfig,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let connector = WsConnector::new(&config.edge.hub_url)?;
    info!(hub = %connector.url(), "Connecting edge to hub");
    let (hub, hub_events) = LinkSession::spawn(connector, policy);

    let ports = Arc::new(SerialPorts::new(&config.edge));
    let (controller, channels) = EdgeController::new(EdgeSettings::from(&config.edge), ports);

    run_edge(controller, channels, hub, hub_events, shutdown).await;
    Ok(())
}

async fn run_bridge_mode(
    config: &CanopyConfig,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let connector = WsConnector::new(&config.bridge.hub_url)?;

    let port = match &config.bridge.port {
        Some(port) => port.clone(),
        None => {
            let Some(port) =
                discover_actuator(&config.bridge.port_hints, policy.delay, &shutdown).await
            else {
                return Ok(());
            };
            port
        }
    };
    info!(port = %port, baud_rate = config.bridge.baud_rate, "Using actuator port");

    let (actuator, actuator_events) = ActuatorLink::spawn(
        SerialLineConnector::new(port.clone(), config.bridge.baud_rate),
        policy,
    );
    let (bridge, upstream) = ActuatorBridge::new(BridgeSettings::new(&config.bridge, port), actuator);

    info!(hub = %connector.url(), "Connecting bridge to hub");
    let (hub, hub_events) = LinkSession::spawn(connector, policy);

    run_bridge(bridge, upstream, actuator_events, hub, hub_events, shutdown).await;
    Ok(())
}

/// Retry discovery every `delay` until a port turns up or `shutdown` fires.
async fn discover_actuator(
    hints: &[String],
    delay: Duration,
    shutdown: &CancellationToken,
) -> Option<String> {
    loop {
        let owned = hints.to_vec();
        match tokio::task::spawn_blocking(move || locate_actuator(&owned)).await {
            Ok(Ok(port)) => return Some(port),
            Ok(Err(e)) => warn!(error = %e, "Actuator discovery failed, retrying"),
            Err(e) => error!(error = %e, "Actuator discovery task failed"),
        }

        tokio::select! {
            () = shutdown.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
                        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
                    }
                }
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating shutdown...");
            }
        }

        shutdown.cancel();
    });
}

/// Compact logs to stderr.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = std::env::var("CANOPY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
