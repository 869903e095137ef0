//! MQTT broker provider
//!
//! Implements `BrokerProvider` on top of `rumqttc`. The initial connect is
//! bounded by `connect_timeout_secs` and fails with `BridgeError::Connection`;
//! later drops are retried by the network loop with exponential backoff and
//! every registered subscription is reissued once the broker accepts the new
//! session.

mod client;
mod config;

pub use client::describe_return_code;
pub use config::MqttConfig;

use crate::error::{BridgeError, Result};
use crate::provider::{BrokerConnection, BrokerProvider};
use crate::types::{ConnectionState, Envelope, QoS};
use async_trait::async_trait;
use client::{SessionDriver, SessionShared};
use rumqttc::AsyncClient;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long `disconnect` waits for the network loop to wind down
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT broker provider
pub struct MqttBroker {
    client: AsyncClient,
    shared: Arc<SessionShared>,
    network_loop: Mutex<Option<JoinHandle<()>>>,
    config: MqttConfig,
}

impl MqttBroker {
    /// Connect to the broker and start the network loop
    ///
    /// `client_prefix` is used to generate a client id when the config does
    /// not carry one.
    pub async fn connect(config: MqttConfig, client_prefix: &str) -> Result<BrokerConnection> {
        let client_id = config.resolve_client_id(client_prefix);
        let options = client::build_mqtt_options(&config, &client_id)?;
        let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity);

        let shared = Arc::new(SessionShared::new());
        shared.state.send_replace(ConnectionState::Connecting);

        tracing::info!(
            address = %config.address(),
            client_id = %client_id,
            "Connecting to MQTT broker"
        );

        let address = config.address();
        if let Err(e) =
            client::establish(&mut eventloop, &address, config.connect_timeout()).await
        {
            shared.state.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }
        shared.state.send_replace(ConnectionState::Connected);
        tracing::info!(address = %address, "Connected to MQTT broker");

        let (events, rx) = mpsc::channel(config.event_capacity);
        let driver = SessionDriver::new(
            client.clone(),
            shared.clone(),
            events,
            config.reconnect.clone(),
        );
        let handle = client::spawn_network_loop(eventloop, driver);

        let broker = Arc::new(MqttBroker {
            client,
            shared,
            network_loop: Mutex::new(Some(handle)),
            config,
        });

        Ok(BrokerConnection::new(broker, rx))
    }
}

#[async_trait]
impl BrokerProvider for MqttBroker {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.shared
            .interest
            .write()
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?
            .insert(topic.to_string(), qos);

        // While reconnecting, the network loop issues it on the next ConnAck
        if self.state() != ConnectionState::Connected {
            tracing::info!(topic, "Subscription deferred until reconnect");
            return Ok(());
        }

        self.client
            .subscribe(topic, client::to_mqtt_qos(qos))
            .await
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic, ?qos, "Subscribed");
        Ok(())
    }

    async fn publish(&self, message: Envelope) -> Result<()> {
        let topic = message.topic.clone();
        let send = self.client.publish(
            message.topic,
            client::to_mqtt_qos(message.qos),
            false,
            message.payload.to_vec(),
        );

        let timeout = self.config.connect_timeout();
        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| publish_timed_out(&topic, timeout))?
            .map_err(|e| BridgeError::Publish {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(topic = %topic, "Message enqueued");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);

        match tokio::time::timeout(LOOP_STOP_TIMEOUT, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Disconnect request failed"),
            Err(_) => tracing::warn!("Disconnect request timed out"),
        }

        let handle = self
            .network_loop
            .lock()
            .map_err(|e| BridgeError::Connection(e.to_string()))?
            .take();

        if let Some(mut handle) = handle {
            if tokio::time::timeout(LOOP_STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Network loop did not stop in time, aborting");
                handle.abort();
            }
        }

        self.shared.state.send_replace(ConnectionState::Disconnected);
        tracing::info!("Disconnected from MQTT broker");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}

fn publish_timed_out(topic: &str, timeout: Duration) -> BridgeError {
    BridgeError::Publish {
        topic: topic.to_string(),
        reason: format!("not accepted by the MQTT client within {:?}", timeout),
    }
}
