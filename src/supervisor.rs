//! Bridge supervisor — lifecycle, dispatch, and shutdown
//!
//! Lifecycle: `Uninitialized → Initializing → Running → ShuttingDown → Stopped`.
//!
//! The supervisor owns the broker connection and the inference invoker (and
//! through it the agent handle). Inbound broker events are consumed by a
//! single dispatch loop; each decoded observation takes an inference slot in
//! arrival order and is handed to a task that runs invoke and publish while
//! holding that slot. On shutdown, dispatch stops, in-flight tasks get a
//! bounded grace period, and the broker session is closed.

use crate::agent::AgentLoader;
use crate::config::{BridgeConfig, CLIENT_ID_PREFIX};
use crate::decoder;
use crate::error::{BridgeError, Result};
use crate::invoker::{InferenceInvoker, InferenceSlot};
use crate::provider::mqtt::MqttBroker;
use crate::provider::{BrokerConnection, BrokerProvider};
use crate::publisher::ResponsePublisher;
use crate::types::{BrokerEvent, Envelope, Observation, BRIDGE_QOS, OBSERVATION_TOPIC};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Tunables for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Concurrent inference calls (1 = serialized, ordered output)
    pub concurrency: usize,
    /// Per-call inference timeout
    pub inference_timeout: Option<Duration>,
    /// How long in-flight work may run after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            inference_timeout: Some(Duration::from_secs(30)),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl From<&BridgeConfig> for SupervisorSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            inference_timeout: config.inference_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    decode_failures: AtomicU64,
    inference_failures: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Message counts for one supervisor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub decode_failures: u64,
    pub inference_failures: u64,
    pub published: u64,
    pub publish_failures: u64,
}

/// Wires decoder, invoker, and publisher into a running service
pub struct Supervisor {
    settings: SupervisorSettings,
    state: watch::Sender<SupervisorState>,
    invoker: Arc<InferenceInvoker>,
    connection: Option<BrokerConnection>,
    counters: Arc<Counters>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Result<Self> {
        let invoker = InferenceInvoker::new(settings.concurrency, settings.inference_timeout)?;
        let (state, _) = watch::channel(SupervisorState::Uninitialized);
        Ok(Self {
            settings,
            state,
            invoker: Arc::new(invoker),
            connection: None,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Whether the inference gate is open
    pub fn is_ready(&self) -> bool {
        self.invoker.is_ready()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            received: self.counters.received.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            inference_failures: self.counters.inference_failures.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
        tracing::info!(?state, "Supervisor state changed");
    }

    /// Load the agent, connect, and subscribe to observations
    ///
    /// The agent is installed before the broker connection is attempted, so
    /// no message can reach the pipeline before the inference gate is open.
    /// Every failure is reported as `BridgeError::FatalInit`.
    pub async fn initialize<C>(
        &mut self,
        loader: &dyn AgentLoader,
        checkpoint: &Path,
        license: &str,
        connect: C,
    ) -> Result<()>
    where
        C: Future<Output = Result<BrokerConnection>>,
    {
        if self.state() != SupervisorState::Uninitialized {
            return Err(BridgeError::FatalInit(format!(
                "cannot initialize from state {:?}",
                self.state()
            )));
        }
        self.set_state(SupervisorState::Initializing);

        let outcome = self.initialize_inner(loader, checkpoint, license, connect).await;
        if let Err(ref e) = outcome {
            tracing::error!(error = %e, "Failed to initialize bridge");
            self.set_state(SupervisorState::Stopped);
        }
        outcome
    }

    async fn initialize_inner<C>(
        &mut self,
        loader: &dyn AgentLoader,
        checkpoint: &Path,
        license: &str,
        connect: C,
    ) -> Result<()>
    where
        C: Future<Output = Result<BrokerConnection>>,
    {
        tracing::info!(checkpoint = %checkpoint.display(), "Loading agent");
        let agent = loader
            .load(checkpoint, license)
            .await
            .map_err(|e| BridgeError::FatalInit(format!("agent load failed: {}", e)))?;

        self.invoker
            .install(agent)
            .map_err(|e| BridgeError::FatalInit(e.to_string()))?;

        let connection = connect
            .await
            .map_err(|e| BridgeError::FatalInit(format!("broker unreachable: {}", e)))?;

        if let Err(e) = connection
            .provider
            .subscribe(OBSERVATION_TOPIC, BRIDGE_QOS)
            .await
        {
            if let Err(close) = connection.provider.disconnect().await {
                tracing::warn!(error = %close, "Failed to close broker connection");
            }
            return Err(BridgeError::FatalInit(e.to_string()));
        }

        tracing::info!(
            provider = connection.provider.name(),
            topic = OBSERVATION_TOPIC,
            "Bridge initialized"
        );
        self.connection = Some(connection);
        Ok(())
    }

    /// Dispatch inbound messages until `shutdown` turns true, then drain
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let BrokerConnection {
            provider,
            mut events,
        } = self.connection.take().ok_or_else(|| {
            BridgeError::Config("supervisor is not initialized".to_string())
        })?;

        let publisher = Arc::new(ResponsePublisher::new(provider.clone()));
        let mut tasks: JoinSet<()> = JoinSet::new();
        self.set_state(SupervisorState::Running);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Pipeline task failed");
                    }
                }
                event = events.recv() => match event {
                    Some(BrokerEvent::Message(message)) => {
                        let Some(observation) = self.decode(&message) else {
                            continue;
                        };
                        let slot = tokio::select! {
                            biased;
                            _ = wait_for_shutdown(&mut shutdown) => {
                                tracing::warn!("Shutdown while waiting for inference slot; observation dropped");
                                break;
                            }
                            slot = self.invoker.acquire() => slot,
                        };
                        match slot {
                            Ok(slot) => {
                                let task = pipeline(slot, observation, publisher.clone(), self.counters.clone());
                                tasks.spawn(task);
                            }
                            Err(e) => {
                                self.counters.inference_failures.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(error = %e, "Observation dropped");
                            }
                        }
                    }
                    Some(BrokerEvent::Connected { session_present }) => {
                        tracing::info!(session_present, "Broker session established");
                    }
                    Some(BrokerEvent::Disconnected { reason }) => {
                        let e = BridgeError::Connection(reason);
                        tracing::warn!(error = %e, "Broker connection lost; waiting for reconnect");
                    }
                    None => {
                        tracing::warn!("Broker event stream closed");
                        break;
                    }
                },
            }
        }

        self.shutdown(provider, tasks).await;
        Ok(())
    }

    /// Decode one inbound message, logging and counting rejections
    fn decode(&self, message: &Envelope) -> Option<Observation> {
        if message.topic != OBSERVATION_TOPIC {
            tracing::debug!(topic = %message.topic, "Ignoring message on unexpected topic");
            return None;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        tracing::info!(topic = %message.topic, bytes = message.payload.len(), "Received message");

        match decoder::decode(&message.payload) {
            Ok(observation) => Some(observation),
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %BridgeError::Decode(e),
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Discarding malformed observation"
                );
                None
            }
        }
    }

    async fn shutdown(&mut self, provider: Arc<dyn BrokerProvider>, mut tasks: JoinSet<()>) {
        self.set_state(SupervisorState::ShuttingDown);
        self.invoker.close();

        let in_flight = tasks.len();
        let grace = self.settings.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Pipeline task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_secs = grace.as_secs_f64(),
                "In-flight inference did not finish in time, cancelling"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        } else if in_flight > 0 {
            tracing::info!(in_flight, "In-flight inference drained");
        }

        if let Err(e) = provider.disconnect().await {
            tracing::warn!(error = %e, "Broker disconnect failed");
        }

        let stats = self.stats();
        tracing::info!(
            received = stats.received,
            published = stats.published,
            decode_failures = stats.decode_failures,
            inference_failures = stats.inference_failures,
            publish_failures = stats.publish_failures,
            "Bridge stopped"
        );
        self.set_state(SupervisorState::Stopped);
    }
}

/// Invoke then publish, holding the inference slot throughout
async fn pipeline(
    slot: InferenceSlot,
    observation: Observation,
    publisher: Arc<ResponsePublisher>,
    counters: Arc<Counters>,
) {
    match slot.invoke(&observation).await {
        Ok(action) => {
            if publisher.publish(&action).await {
                counters.published.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(e) => {
            counters.inference_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Error processing observation; dropped");
        }
    }
    drop(slot);
}

/// Resolves once the flag is set or its sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Run the bridge against the configured MQTT broker until `shutdown`
///
/// Returns `BridgeError::FatalInit` for any startup failure; once running,
/// every other error is logged and absorbed.
pub async fn run_bridge(config: BridgeConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    config.validate()?;

    let mut supervisor = Supervisor::new(SupervisorSettings::from(&config))
        .map_err(|e| BridgeError::FatalInit(e.to_string()))?;

    supervisor
        .initialize(
            &crate::agent::LinearPolicyLoader,
            &config.checkpoint,
            config.license(),
            MqttBroker::connect(config.mqtt(), CLIENT_ID_PREFIX),
        )
        .await?;

    supervisor.run(shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::error::AgentError;
    use crate::provider::memory::MemoryBroker;
    use crate::types::{Action, ConnectionState, QoS};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct SumAgent;

    #[async_trait]
    impl Agent for SumAgent {
        async fn execute(&self, observation: &[f64]) -> std::result::Result<Action, AgentError> {
            Ok(Action::Scalar(observation.iter().sum()))
        }

        fn name(&self) -> &str {
            "sum"
        }
    }

    struct StaticLoader(Option<Arc<dyn Agent>>);

    #[async_trait]
    impl AgentLoader for StaticLoader {
        async fn load(
            &self,
            checkpoint: &Path,
            _license: &str,
        ) -> std::result::Result<Arc<dyn Agent>, AgentError> {
            self.0.clone().ok_or_else(|| AgentError::Checkpoint {
                path: checkpoint.display().to_string(),
                reason: "missing".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Uninitialized);
        assert!(!supervisor.is_ready());

        let (broker, conn) = MemoryBroker::connect();
        supervisor
            .initialize(
                &StaticLoader(Some(Arc::new(SumAgent))),
                Path::new("agent.json"),
                "key",
                async { Ok::<_, BridgeError>(conn) },
            )
            .await
            .unwrap();

        assert!(supervisor.is_ready());
        assert_eq!(supervisor.state(), SupervisorState::Initializing);
        assert_eq!(broker.active_subscriptions(), vec![OBSERVATION_TOPIC.to_string()]);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_fatal_and_skips_connect() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let connected = std::sync::atomic::AtomicBool::new(false);

        let err = supervisor
            .initialize(&StaticLoader(None), Path::new("missing.json"), "key", async {
                connected.store(true, Ordering::SeqCst);
                Ok::<_, BridgeError>(MemoryBroker::connect().1)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::FatalInit(_)));
        assert!(!connected.load(Ordering::SeqCst));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_broker_unreachable_is_fatal() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let err = supervisor
            .initialize(
                &StaticLoader(Some(Arc::new(SumAgent))),
                Path::new("agent.json"),
                "key",
                async { Err::<BrokerConnection, _>(BridgeError::Connection("refused".to_string())) },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broker unreachable"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    /// Broker that accepts the connection but refuses every subscription
    struct RefusingBroker {
        closed: AtomicBool,
        state: watch::Sender<ConnectionState>,
    }

    #[async_trait]
    impl BrokerProvider for RefusingBroker {
        async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
            Err(BridgeError::Subscribe {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            })
        }

        async fn publish(&self, _message: Envelope) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.state.send_replace(ConnectionState::Disconnected);
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            *self.state.borrow()
        }

        fn watch_state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        fn name(&self) -> &str {
            "refusing"
        }
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_connection() {
        let broker = Arc::new(RefusingBroker {
            closed: AtomicBool::new(false),
            state: watch::channel(ConnectionState::Connected).0,
        });
        let (_events, rx) = tokio::sync::mpsc::channel(1);
        let conn = BrokerConnection::new(broker.clone(), rx);

        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let err = supervisor
            .initialize(
                &StaticLoader(Some(Arc::new(SumAgent))),
                Path::new("agent.json"),
                "key",
                async { Ok::<_, BridgeError>(conn) },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::FatalInit(_)));
        assert!(err.to_string().contains("not authorized"));
        assert!(broker.closed.load(Ordering::SeqCst));
        assert_eq!(broker.state(), ConnectionState::Disconnected);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_initialize_twice_rejected() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let loader = StaticLoader(Some(Arc::new(SumAgent)));
        supervisor
            .initialize(&loader, Path::new("a"), "key", async {
                Ok::<_, BridgeError>(MemoryBroker::connect().1)
            })
            .await
            .unwrap();
        assert!(supervisor
            .initialize(&loader, Path::new("a"), "key", async {
                Ok::<_, BridgeError>(MemoryBroker::connect().1)
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_requires_initialize() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(supervisor.run(rx).await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let mut supervisor = Supervisor::new(SupervisorSettings::default()).unwrap();
        let (broker, conn) = MemoryBroker::connect();
        supervisor
            .initialize(
                &StaticLoader(Some(Arc::new(SumAgent))),
                Path::new("agent.json"),
                "key",
                async { Ok::<_, BridgeError>(conn) },
            )
            .await
            .unwrap();

        let mut states = supervisor.watch_state();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            supervisor.run(rx).await.unwrap();
            supervisor
        });

        states
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        let payload = r#"{"observation":{"T":1,"Tc":1,"Ca":1,"Cref":1,"Tref":1,"Conc_Error":1,"Eps_Yield":1,"Cb_Prod":1}}"#;
        assert!(broker.inject(Envelope::new(OBSERVATION_TOPIC, payload, BRIDGE_QOS)));
        let sent = broker
            .wait_for_published(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&sent[0].payload[..], br#"{"action":8.0}"#);

        tx.send(true).unwrap();
        let supervisor = handle.await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.stats().published, 1);
        assert_eq!(
            broker.state(),
            crate::types::ConnectionState::Disconnected
        );
    }
}
