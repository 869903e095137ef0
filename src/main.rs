//! agent-bridge - serves a pre-trained control agent over MQTT
//!
//! Subscribes to `agent/observation`, runs each observation through the agent
//! and publishes the action on `agent/action`. Configuration comes from flags
//! or the environment (`MQTT_BROKER`, `MQTT_PORT`, `AGENT_LICENSE`, ...).

use agent_bridge::{run_bridge, BridgeConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-bridge")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "MQTT bridge between sensor observations and a control agent")]
struct Cli {
    #[command(flatten)]
    config: BridgeConfig,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agent_bridge={},rumqttc=warn", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = stop.send(true);
    });

    run_bridge(cli.config, shutdown)
        .await
        .context("agent bridge terminated")
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
