//! Bridge configuration
//!
//! Every setting can come from a command-line flag or from the environment,
//! which is how the bridge is normally configured inside a container.

use crate::error::{BridgeError, Result};
use crate::provider::mqtt::MqttConfig;
use crate::provider::{ReconnectPolicy, DEFAULT_EVENT_CAPACITY};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Client id prefix used when none is configured
pub const CLIENT_ID_PREFIX: &str = "agent-bridge";

/// Runtime configuration for the bridge
#[derive(Debug, Clone, Args)]
pub struct BridgeConfig {
    /// MQTT broker hostname
    #[arg(long, env = "MQTT_BROKER", default_value = "mqtt-broker")]
    pub broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub broker_port: u16,

    /// License value required to initialize the agent
    #[arg(long, env = "AGENT_LICENSE", hide_env_values = true)]
    pub license: Option<String>,

    /// Agent checkpoint file
    #[arg(long, env = "AGENT_CHECKPOINT", default_value = "model/agent.json")]
    pub checkpoint: PathBuf,

    /// MQTT keepalive in seconds
    #[arg(long, env = "MQTT_KEEPALIVE", default_value_t = 60)]
    pub keepalive_secs: u64,

    /// Maximum time for the startup connect
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// MQTT client id (random per process when unset)
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Concurrent inference calls; values above 1 need a reentrant agent
    #[arg(long, env = "AGENT_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    /// Per-call inference timeout in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    pub inference_timeout_secs: u64,

    /// Time allowed for in-flight inference to finish on shutdown
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Inbound messages buffered while inference is busy; extras are dropped
    #[arg(long, env = "AGENT_EVENT_CAPACITY", default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_host: "mqtt-broker".to_string(),
            broker_port: 1883,
            license: None,
            checkpoint: PathBuf::from("model/agent.json"),
            keepalive_secs: 60,
            connect_timeout_secs: 10,
            client_id: None,
            concurrency: 1,
            inference_timeout_secs: 30,
            shutdown_grace_secs: 10,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl BridgeConfig {
    /// Check required values; any failure is fatal at startup
    pub fn validate(&self) -> Result<()> {
        let fatal = |msg: &str| Err(BridgeError::FatalInit(msg.to_string()));

        match self.license.as_deref() {
            None => return fatal("AGENT_LICENSE is not set"),
            Some(l) if l.trim().is_empty() => return fatal("AGENT_LICENSE is empty"),
            Some(_) => {}
        }
        if self.broker_host.trim().is_empty() {
            return fatal("broker host is empty");
        }
        if self.broker_port == 0 {
            return fatal("broker port must be non-zero");
        }
        if self.keepalive_secs < 5 {
            return fatal("keepalive must be at least 5 seconds");
        }
        if self.concurrency == 0 {
            return fatal("concurrency must be at least 1");
        }
        if self.event_capacity == 0 {
            return fatal("event capacity must be at least 1");
        }
        Ok(())
    }

    /// License value; empty when unset (rejected by `validate`)
    pub fn license(&self) -> &str {
        self.license.as_deref().unwrap_or_default()
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        (self.inference_timeout_secs > 0).then(|| Duration::from_secs(self.inference_timeout_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Broker provider settings derived from this config
    pub fn mqtt(&self) -> MqttConfig {
        MqttConfig {
            host: self.broker_host.clone(),
            port: self.broker_port,
            client_id: self.client_id.clone(),
            keepalive_secs: self.keepalive_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            clean_session: true,
            request_capacity: 64,
            event_capacity: self.event_capacity,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
