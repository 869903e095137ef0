//! MQTT provider configuration

use crate::provider::{ReconnectPolicy, DEFAULT_EVENT_CAPACITY};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the MQTT provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,

    /// Broker TCP port
    pub port: u16,

    /// Client identifier; generated per process when `None`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Keepalive interval in seconds
    pub keepalive_secs: u64,

    /// How long the initial connect may take
    pub connect_timeout_secs: u64,

    /// Start each session clean (subscriptions are not kept by the broker)
    pub clean_session: bool,

    /// Capacity of the client request queue
    pub request_capacity: usize,

    /// Bound of the inbound event queue; messages beyond it are dropped
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Delay schedule between reconnect attempts
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            keepalive_secs: 60,
            connect_timeout_secs: 10,
            clean_session: true,
            request_capacity: 64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl MqttConfig {
    /// Config for a broker at `host:port` with defaults otherwise
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// The configured client id, or a fresh one with the given prefix
    pub fn resolve_client_id(&self, prefix: &str) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", prefix, &id[..8])
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
