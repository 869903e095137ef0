//! observation-producer - publishes random plant observations for testing
//!
//! Sends one `{"observation": {...}}` message on `agent/observation` per
//! interval until interrupted. Values are drawn uniformly from plausible
//! operating ranges of the reactor.

use agent_bridge::{
    Envelope, MqttBroker, MqttConfig, Observation, ObservationMessage, BRIDGE_QOS,
    OBSERVATION_TOPIC,
};
use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "observation-producer")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Publish random observations for the agent bridge")]
struct Cli {
    /// MQTT broker hostname
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// Seconds between observations
    #[arg(short, long, default_value_t = 5.0)]
    interval: f64,

    /// Stop after this many observations
    #[arg(short, long)]
    count: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Draw one observation from the operating ranges
fn random_observation<R: Rng>(rng: &mut R) -> Observation {
    Observation {
        t: rng.gen_range(200.0..420.0),
        tc: rng.gen_range(180.0..300.0),
        ca: rng.gen_range(5.0..10.0),
        cref: rng.gen_range(3.0..15.0),
        tref: rng.gen_range(250.0..320.0),
        conc_error: rng.gen_range(0.0..10.0),
        eps_yield: rng.gen_range(0.0..50.0),
        cb_prod: rng.gen_range(0.0..10.0),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("observation_producer={0},agent_bridge={0}", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !(cli.interval.is_finite() && cli.interval > 0.0) {
        anyhow::bail!("interval must be a positive number of seconds");
    }

    let connection = MqttBroker::connect(
        MqttConfig::new(cli.broker_host.clone(), cli.broker_port),
        "observation-producer",
    )
    .await
    .context("failed to connect to MQTT broker")?;
    let provider = connection.provider;

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(cli.interval));
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping producer");
                break;
            }
            _ = ticker.tick() => {
                let observation = random_observation(&mut rand::thread_rng());
                let payload = serde_json::to_vec(&ObservationMessage { observation })?;
                let envelope = Envelope::new(OBSERVATION_TOPIC, payload, BRIDGE_QOS);

                match provider.publish(envelope).await {
                    Ok(()) => {
                        sent += 1;
                        tracing::info!(?observation, "Published observation");
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to publish observation"),
                }

                if cli.count.is_some_and(|limit| sent >= limit) {
                    break;
                }
            }
        }
    }

    provider.disconnect().await?;
    tracing::info!(sent, "Producer stopped");
    Ok(())
}
