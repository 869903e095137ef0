//! In-memory broker provider
//!
//! Single-process loopback broker for tests and local runs. Messages
//! published to a topic with an active subscription are delivered back as
//! `BrokerEvent::Message`. Network failures can be simulated with
//! `simulate_drop`, after which the provider reconnects and reissues every
//! registered subscription on its own.

use super::{offer, BrokerConnection, BrokerProvider, Delivery, DEFAULT_EVENT_CAPACITY};
use crate::error::{BridgeError, Result};
use crate::types::{BrokerEvent, ConnectionState, Envelope, QoS};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Inner {
    events: mpsc::Sender<BrokerEvent>,
    state: watch::Sender<ConnectionState>,
    /// Registered interest, survives reconnects
    interest: RwLock<HashMap<String, QoS>>,
    /// Subscriptions active in the current session
    active: RwLock<HashMap<String, QoS>>,
    published: Mutex<Vec<Envelope>>,
    published_count: watch::Sender<usize>,
    fail_publish: AtomicBool,
}

impl Inner {
    fn emit(&self, event: BrokerEvent) -> Delivery {
        offer(&self.events, event)
    }

    fn resubscribe(&self) {
        let interest = self.interest.read().map(|i| i.clone()).unwrap_or_default();
        if let Ok(mut active) = self.active.write() {
            *active = interest;
        }
        self.state.send_replace(ConnectionState::Connected);
        let _ = self.emit(BrokerEvent::Connected {
            session_present: false,
        });
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.active
            .read()
            .map(|active| active.keys().any(|filter| topic_matches(filter, topic)))
            .unwrap_or(false)
    }
}

/// In-memory broker
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Open a connected session and return it with its event stream
    pub fn connect() -> (Arc<MemoryBroker>, BrokerConnection) {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Like `connect`, with a custom bound on the inbound event queue
    pub fn with_capacity(capacity: usize) -> (Arc<MemoryBroker>, BrokerConnection) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (published_count, _) = watch::channel(0);

        let broker = Arc::new(MemoryBroker {
            inner: Arc::new(Inner {
                events,
                state,
                interest: RwLock::new(HashMap::new()),
                active: RwLock::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
                published_count,
                fail_publish: AtomicBool::new(false),
            }),
        });
        broker.inner.resubscribe();

        let connection = BrokerConnection::new(broker.clone(), rx);
        (broker, connection)
    }

    /// Deliver a message as if it arrived from the network
    ///
    /// Returns `false` when the session is down, nothing subscribes to the
    /// topic, or the inbound queue is full; the message is then lost, as
    /// with a real broker.
    pub fn inject(&self, message: Envelope) -> bool {
        if self.state() != ConnectionState::Connected || !self.inner.is_subscribed(&message.topic)
        {
            tracing::debug!(topic = %message.topic, "Injected message not delivered");
            return false;
        }
        self.inner.emit(BrokerEvent::Message(message)) == Delivery::Delivered
    }

    /// Drop the session and reconnect after `outage`
    pub fn simulate_drop(&self, outage: Duration) {
        if let Ok(mut active) = self.inner.active.write() {
            active.clear();
        }
        self.inner.state.send_replace(ConnectionState::Reconnecting);
        let _ = self.inner.emit(BrokerEvent::Disconnected {
            reason: "simulated network failure".to_string(),
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(outage).await;
            // A deliberate disconnect during the outage wins
            if *inner.state.borrow() == ConnectionState::Reconnecting {
                inner.resubscribe();
            }
        });
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// All messages published so far
    pub fn published(&self) -> Vec<Envelope> {
        self.inner
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Messages published to one topic
    pub fn published_on(&self, topic: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Wait until at least `count` messages have been published
    ///
    /// Returns the published messages, or `None` on timeout.
    pub async fn wait_for_published(&self, count: usize, limit: Duration) -> Option<Vec<Envelope>> {
        let mut rx = self.inner.published_count.subscribe();
        tokio::time::timeout(limit, rx.wait_for(|n| *n >= count))
            .await
            .ok()?
            .ok()?;
        Some(self.published())
    }

    /// Topics subscribed in the current session
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner
            .active
            .read()
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerProvider for MemoryBroker {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.inner
            .interest
            .write()
            .map_err(|e| BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?
            .insert(topic.to_string(), qos);

        if self.state() == ConnectionState::Connected {
            if let Ok(mut active) = self.inner.active.write() {
                active.insert(topic.to_string(), qos);
            }
        }

        tracing::debug!(topic, ?qos, "Memory subscription registered");
        Ok(())
    }

    async fn publish(&self, message: Envelope) -> Result<()> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish {
                topic: message.topic,
                reason: "publish failure injected".to_string(),
            });
        }
        if self.state() != ConnectionState::Connected {
            return Err(BridgeError::Publish {
                topic: message.topic,
                reason: format!("session is {}", self.state()),
            });
        }

        let loopback = self.inner.is_subscribed(&message.topic);
        {
            let mut published = self.inner.published.lock().map_err(|e| BridgeError::Publish {
                topic: message.topic.clone(),
                reason: e.to_string(),
            })?;
            published.push(message.clone());
            self.inner.published_count.send_replace(published.len());
        }
        if loopback {
            let _ = self.inner.emit(BrokerEvent::Message(message));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Ok(mut active) = self.inner.active.write() {
            active.clear();
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// MQTT topic filter matching (`+` one level, `#` remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ACTION_TOPIC, OBSERVATION_TOPIC};

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("agent/observation", "agent/observation"));
        assert!(!topic_matches("agent/observation", "agent/action"));
        assert!(topic_matches("agent/+", "agent/action"));
        assert!(topic_matches("agent/#", "agent/a/b"));
        assert!(topic_matches("#", "agent"));
        assert!(!topic_matches("agent/+", "agent/a/b"));
        assert!(!topic_matches("agent/observation/x", "agent/observation"));
    }

    #[tokio::test]
    async fn test_connect_emits_connected() {
        let (broker, mut conn) = MemoryBroker::connect();
        assert_eq!(broker.state(), ConnectionState::Connected);
        assert_eq!(
            conn.events.recv().await.unwrap(),
            BrokerEvent::Connected {
                session_present: false
            }
        );
    }

    #[tokio::test]
    async fn test_inject_requires_subscription() {
        let (broker, mut conn) = MemoryBroker::connect();
        conn.events.recv().await.unwrap();

        let msg = Envelope::new(OBSERVATION_TOPIC, "x", QoS::ExactlyOnce);
        assert!(!broker.inject(msg.clone()));

        broker.subscribe(OBSERVATION_TOPIC, QoS::ExactlyOnce).await.unwrap();
        assert!(broker.inject(msg.clone()));
        assert_eq!(conn.events.recv().await.unwrap(), BrokerEvent::Message(msg));
    }

    #[tokio::test]
    async fn test_full_queue_drops_injected_messages() {
        let (broker, mut conn) = MemoryBroker::with_capacity(2);
        broker.subscribe(OBSERVATION_TOPIC, QoS::ExactlyOnce).await.unwrap();

        // The Connected event holds one slot
        assert!(broker.inject(Envelope::new(OBSERVATION_TOPIC, "a", QoS::ExactlyOnce)));
        assert!(!broker.inject(Envelope::new(OBSERVATION_TOPIC, "b", QoS::ExactlyOnce)));
        assert!(!broker.inject(Envelope::new(OBSERVATION_TOPIC, "c", QoS::ExactlyOnce)));

        assert!(matches!(
            conn.events.recv().await.unwrap(),
            BrokerEvent::Connected { .. }
        ));
        assert_eq!(
            conn.events.recv().await.unwrap(),
            BrokerEvent::Message(Envelope::new(OBSERVATION_TOPIC, "a", QoS::ExactlyOnce))
        );
        assert!(conn.events.try_recv().is_err());

        assert!(broker.inject(Envelope::new(OBSERVATION_TOPIC, "d", QoS::ExactlyOnce)));
    }

    #[tokio::test]
    async fn test_publish_records_and_loops_back() {
        let (broker, mut conn) = MemoryBroker::connect();
        conn.events.recv().await.unwrap();
        broker.subscribe("agent/#", QoS::ExactlyOnce).await.unwrap();

        let msg = Envelope::new(ACTION_TOPIC, r#"{"action":1.0}"#, QoS::ExactlyOnce);
        broker.publish(msg.clone()).await.unwrap();

        assert_eq!(broker.published_on(ACTION_TOPIC), vec![msg.clone()]);
        assert_eq!(conn.events.recv().await.unwrap(), BrokerEvent::Message(msg));
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let (broker, _conn) = MemoryBroker::connect();
        broker.set_fail_publish(true);
        let err = broker
            .publish(Envelope::new(ACTION_TOPIC, "{}", QoS::ExactlyOnce))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Publish { .. }));
        assert!(broker.published().is_empty());

        broker.set_fail_publish(false);
        broker
            .publish(Envelope::new(ACTION_TOPIC, "{}", QoS::ExactlyOnce))
            .await
            .unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_then_resubscribe() {
        let (broker, mut conn) = MemoryBroker::connect();
        conn.events.recv().await.unwrap();
        broker.subscribe(OBSERVATION_TOPIC, QoS::ExactlyOnce).await.unwrap();

        broker.simulate_drop(Duration::from_millis(20));
        assert_eq!(broker.state(), ConnectionState::Reconnecting);
        assert!(broker.active_subscriptions().is_empty());
        assert!(!broker.inject(Envelope::new(OBSERVATION_TOPIC, "lost", QoS::ExactlyOnce)));
        assert!(matches!(
            conn.events.recv().await.unwrap(),
            BrokerEvent::Disconnected { .. }
        ));

        assert!(matches!(
            conn.events.recv().await.unwrap(),
            BrokerEvent::Connected { .. }
        ));
        assert_eq!(broker.state(), ConnectionState::Connected);
        assert_eq!(broker.active_subscriptions(), vec![OBSERVATION_TOPIC.to_string()]);
        assert!(broker.inject(Envelope::new(OBSERVATION_TOPIC, "kept", QoS::ExactlyOnce)));
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let (broker, _conn) = MemoryBroker::connect();
        broker.subscribe(OBSERVATION_TOPIC, QoS::ExactlyOnce).await.unwrap();
        broker.disconnect().await.unwrap();
        assert_eq!(broker.state(), ConnectionState::Disconnected);
        assert!(!broker.inject(Envelope::new(OBSERVATION_TOPIC, "x", QoS::ExactlyOnce)));
        assert!(broker
            .publish(Envelope::new(ACTION_TOPIC, "{}", QoS::ExactlyOnce))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wait_for_published_times_out() {
        let (broker, _conn) = MemoryBroker::connect();
        assert!(broker
            .wait_for_published(1, Duration::from_millis(20))
            .await
            .is_none());
    }
}
