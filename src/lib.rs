//! # agent-bridge
//!
//! Serves a pre-trained control agent over MQTT: sensor observations arrive on
//! `agent/observation`, are run through the agent, and the resulting action is
//! published on `agent/action`, both with QoS 2.
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_bridge::{BridgeError, LinearPolicyLoader, MemoryBroker, Supervisor, SupervisorSettings};
//! use std::path::Path;
//!
//! # async fn example() -> agent_bridge::Result<()> {
//! // Serialized inference, in-memory broker
//! let (_broker, connection) = MemoryBroker::connect();
//! let mut supervisor = Supervisor::new(SupervisorSettings::default())?;
//!
//! supervisor
//!     .initialize(
//!         &LinearPolicyLoader,
//!         Path::new("model/agent.json"),
//!         "license-key",
//!         async { Ok::<_, BridgeError>(connection) },
//!     )
//!     .await?;
//!
//! // Runs until the flag flips to true
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! supervisor.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! - **provider** — `BrokerProvider` trait with MQTT and in-memory backends
//! - **decoder** — validates `{"observation": {...}}` payloads
//! - **invoker** — readiness gate and bounded concurrency around the agent
//! - **publisher** — serializes `{"action": ...}` responses
//! - **supervisor** — lifecycle, dispatch loop, and graceful shutdown

pub mod agent;
pub mod config;
pub mod decoder;
pub mod error;
pub mod invoker;
pub mod provider;
pub mod publisher;
pub mod supervisor;
pub mod types;

pub use agent::{Agent, AgentLoader, LinearCheckpoint, LinearPolicy, LinearPolicyLoader};
pub use config::BridgeConfig;
pub use decoder::decode;
pub use error::{AgentError, BridgeError, DecodeError, Result};
pub use invoker::{InferenceInvoker, InferenceSlot};
pub use provider::{BrokerConnection, BrokerProvider, ReconnectPolicy};
pub use publisher::ResponsePublisher;
pub use supervisor::{run_bridge, BridgeStats, Supervisor, SupervisorSettings, SupervisorState};
pub use types::{
    Action, ActionMessage, BrokerEvent, ConnectionState, Envelope, Observation,
    ObservationMessage, QoS, ACTION_TOPIC, BRIDGE_QOS, OBSERVATION_FIELDS, OBSERVATION_TOPIC,
};

pub use provider::memory::MemoryBroker;
pub use provider::mqtt::{MqttBroker, MqttConfig};
