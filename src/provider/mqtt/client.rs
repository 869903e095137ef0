//! MQTT session handling: initial connect, network loop, resubscribe

use super::config::MqttConfig;
use crate::error::{BridgeError, Result};
use crate::provider::{offer, Delivery, ReconnectPolicy};
use crate::types::{BrokerEvent, ConnectionState, Envelope, QoS};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// State shared between the provider handle and its network loop
pub(crate) struct SessionShared {
    pub state: watch::Sender<ConnectionState>,
    /// Registered subscriptions, reissued after every ConnAck
    pub interest: RwLock<HashMap<String, QoS>>,
    /// Set once a deliberate disconnect has been requested
    pub closing: AtomicBool,
}

impl SessionShared {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            interest: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "MQTT session state changed");
        }
    }

    fn interest(&self) -> Vec<(String, QoS)> {
        self.interest
            .read()
            .map(|i| i.iter().map(|(t, q)| (t.clone(), *q)).collect())
            .unwrap_or_default()
    }
}

/// Build rumqttc options from config
pub(crate) fn build_mqtt_options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions> {
    if client_id.is_empty() || client_id.starts_with(' ') {
        return Err(BridgeError::Config(format!(
            "invalid MQTT client id '{}'",
            client_id
        )));
    }
    if config.event_capacity == 0 {
        return Err(BridgeError::Config(
            "event capacity must be at least 1".to_string(),
        ));
    }
    if config.keepalive_secs < 5 {
        return Err(BridgeError::Config(format!(
            "keepalive must be at least 5 seconds, got {}",
            config.keepalive_secs
        )));
    }

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
    options.set_clean_session(config.clean_session);
    Ok(options)
}

/// Drive the event loop until the broker acknowledges the session
///
/// Returns the ConnAck `session_present` flag.
pub(crate) async fn establish(
    eventloop: &mut EventLoop,
    address: &str,
    limit: Duration,
) -> Result<bool> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(ack.session_present);
                    }
                    return Err(BridgeError::Connection(format!(
                        "{}: {}",
                        address,
                        describe_return_code(ack.code)
                    )));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(BridgeError::Connection(format!(
                        "{}: {}",
                        address,
                        describe_connection_error(&e)
                    )))
                }
            }
        }
    };

    tokio::time::timeout(limit, handshake).await.map_err(|_| {
        BridgeError::Connection(format!(
            "{}: no ConnAck within {}s",
            address,
            limit.as_secs()
        ))
    })?
}

/// What the network loop does after one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Wait before polling again; the next poll reconnects
    Backoff(Duration),
    Stop,
}

/// Per-session bookkeeping driven by event loop poll results
///
/// Holds everything the loop mutates between polls, so each poll result
/// can be handled without a live broker.
pub(crate) struct SessionDriver {
    client: AsyncClient,
    shared: Arc<SessionShared>,
    events: mpsc::Sender<BrokerEvent>,
    policy: ReconnectPolicy,
    attempt: u32,
}

impl SessionDriver {
    pub fn new(
        client: AsyncClient,
        shared: Arc<SessionShared>,
        events: mpsc::Sender<BrokerEvent>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            client,
            shared,
            events,
            policy,
            attempt: 0,
        }
    }

    pub fn handle(&mut self, polled: std::result::Result<Event, ConnectionError>) -> Step {
        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Envelope {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: from_mqtt_qos(publish.qos),
                };
                match offer(&self.events, BrokerEvent::Message(message)) {
                    Delivery::Closed => {
                        tracing::debug!("Event receiver dropped, stopping network loop");
                        Step::Stop
                    }
                    Delivery::Delivered | Delivery::Dropped => Step::Continue,
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    tracing::error!(
                        reason = describe_return_code(ack.code),
                        "MQTT reconnect refused"
                    );
                    return Step::Continue;
                }
                self.attempt = 0;
                self.shared.set_state(ConnectionState::Connected);
                let reissued = resubscribe(&self.client, &self.shared);
                tracing::info!(
                    session_present = ack.session_present,
                    subscriptions = reissued,
                    "Reconnected to MQTT broker"
                );
                let _ = offer(
                    &self.events,
                    BrokerEvent::Connected {
                        session_present: ack.session_present,
                    },
                );
                Step::Continue
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if self.is_closing() => Step::Stop,
            Ok(_) => Step::Continue,
            Err(_) if self.is_closing() => Step::Stop,
            Err(e) => {
                let reason = describe_connection_error(&e);
                if self.shared.state() == ConnectionState::Connected {
                    let _ = offer(
                        &self.events,
                        BrokerEvent::Disconnected {
                            reason: reason.clone(),
                        },
                    );
                }
                self.shared.set_state(ConnectionState::Reconnecting);

                let delay = self.policy.delay_for_attempt(self.attempt);
                self.attempt = self.attempt.saturating_add(1);
                tracing::warn!(
                    error = %reason,
                    attempt = self.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Unexpected MQTT disconnection, attempting to reconnect"
                );
                Step::Backoff(delay)
            }
        }
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }
}

/// Spawn the persistent network loop
///
/// The loop only forwards events and reissues subscriptions; all message
/// handling happens on the receiving side of `events`.
pub(crate) fn spawn_network_loop(
    mut eventloop: EventLoop,
    mut driver: SessionDriver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match driver.handle(eventloop.poll().await) {
                Step::Continue => {}
                Step::Backoff(delay) => tokio::time::sleep(delay).await,
                Step::Stop => break,
            }
        }

        driver.shared.set_state(ConnectionState::Disconnected);
        tracing::info!("MQTT network loop stopped");
    })
}

/// Reissue every registered subscription on the fresh session
///
/// Uses the non-blocking request path: this runs inside the network loop,
/// which is the only consumer of the request queue. Returns how many
/// requests were queued.
fn resubscribe(client: &AsyncClient, shared: &SessionShared) -> usize {
    let mut reissued = 0;
    for (topic, qos) in shared.interest() {
        match client.try_subscribe(topic.clone(), to_mqtt_qos(qos)) {
            Ok(()) => {
                reissued += 1;
                tracing::info!(topic = %topic, "Resubscribed");
            }
            Err(e) => tracing::error!(topic = %topic, error = %e, "Failed to resubscribe"),
        }
    }
    reissued
}

pub(crate) fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub(crate) fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Human-readable ConnAck return code
pub fn describe_return_code(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Connected successfully",
        ConnectReturnCode::RefusedProtocolVersion => "Incorrect protocol version",
        ConnectReturnCode::BadClientId => "Invalid client identifier",
        ConnectReturnCode::ServiceUnavailable => "Server unavailable",
        ConnectReturnCode::BadUserNamePassword => "Bad username or password",
        ConnectReturnCode::NotAuthorized => "Not authorized",
    }
}

fn describe_connection_error(error: &ConnectionError) -> String {
    match error {
        ConnectionError::ConnectionRefused(code) => describe_return_code(*code).to_string(),
        other => other.to_string(),
    }
}
