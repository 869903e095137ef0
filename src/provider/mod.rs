//! Broker provider trait — the BrokerConnection abstraction
//!
//! A provider owns one broker session and its network loop. Inbound traffic
//! and session changes arrive as `BrokerEvent`s on the receiver handed out
//! with the connection, so consumers never run inside the network loop.

use crate::error::Result;
use crate::types::{BrokerEvent, ConnectionState, Envelope, QoS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

pub mod memory;
pub mod mqtt;

/// Core trait for broker backends
///
/// Implementations keep track of registered subscriptions and reissue them
/// after every successful reconnect, since clean sessions drop them.
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    /// Register interest in a topic; remembered across reconnects
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Enqueue a message for delivery
    async fn publish(&self, message: Envelope) -> Result<()>;

    /// Close the session and stop the network loop
    async fn disconnect(&self) -> Result<()>;

    /// Current session state
    fn state(&self) -> ConnectionState;

    /// Watch session state transitions
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Provider name (e.g., "mqtt", "memory")
    fn name(&self) -> &str;
}

/// Default bound of the inbound event queue
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// An established broker session plus its inbound event stream
///
/// The stream is bounded; when the consumer falls behind, providers drop
/// new events instead of blocking their network loop.
pub struct BrokerConnection {
    pub provider: Arc<dyn BrokerProvider>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

impl BrokerConnection {
    pub fn new(provider: Arc<dyn BrokerProvider>, events: mpsc::Receiver<BrokerEvent>) -> Self {
        Self { provider, events }
    }
}

/// Result of offering an event to the inbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full; the event was discarded
    Dropped,
    /// Receiver gone; nobody is dispatching anymore
    Closed,
}

/// Queue an event without waiting for room
pub(crate) fn offer(events: &mpsc::Sender<BrokerEvent>, event: BrokerEvent) -> Delivery {
    match events.try_send(event) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(BrokerEvent::Message(message))) => {
            tracing::warn!(
                topic = %message.topic,
                bytes = message.payload.len(),
                capacity = events.max_capacity(),
                "Inbound queue full, dropping message"
            );
            Delivery::Dropped
        }
        Err(TrySendError::Full(event)) => {
            tracing::warn!(?event, "Inbound queue full, dropping session event");
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Delay schedule between reconnect attempts
///
/// Exponential growth `base * 2^attempt`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(exp_delay.min(self.max_delay_ms))
    }
}
