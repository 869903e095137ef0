//! Inference invocation with a readiness gate and bounded concurrency
//!
//! All access to the agent handle goes through `InferenceInvoker`. Calls are
//! funneled through a semaphore sized at construction: one permit (the
//! default) serializes inference, more permits are only accepted for agents
//! that declare themselves reentrant.

use crate::agent::Agent;
use crate::error::{BridgeError, Result};
use crate::types::{Action, Observation};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Gatekeeper for the shared agent handle
pub struct InferenceInvoker {
    agent: OnceLock<Arc<dyn Agent>>,
    gate: Arc<Semaphore>,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl InferenceInvoker {
    /// Create an invoker that is not ready until `install` is called
    pub fn new(concurrency: usize, timeout: Option<Duration>) -> Result<Self> {
        if concurrency == 0 {
            return Err(BridgeError::Config(
                "inference concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            agent: OnceLock::new(),
            gate: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            timeout,
        })
    }

    /// Serialized invoker with no timeout
    pub fn serialized() -> Self {
        Self {
            agent: OnceLock::new(),
            gate: Arc::new(Semaphore::new(1)),
            concurrency: 1,
            timeout: None,
        }
    }

    /// Install the agent handle and open the readiness gate
    ///
    /// Fails if a handle is already installed, or if concurrency > 1 was
    /// requested for an agent that does not guarantee reentrancy.
    pub fn install(&self, agent: Arc<dyn Agent>) -> Result<()> {
        if self.concurrency > 1 && !agent.is_reentrant() {
            return Err(BridgeError::Config(format!(
                "agent '{}' is not reentrant; concurrency {} requires a reentrant agent",
                agent.name(),
                self.concurrency
            )));
        }

        let name = agent.name().to_string();
        self.agent
            .set(agent)
            .map_err(|_| BridgeError::Config("agent handle already installed".to_string()))?;

        tracing::info!(
            agent = %name,
            concurrency = self.concurrency,
            "Inference gate open"
        );
        Ok(())
    }

    /// Whether the agent handle has been installed
    pub fn is_ready(&self) -> bool {
        self.agent.get().is_some()
    }

    /// Maximum number of in-flight invocations
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of permits currently free
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Wait for an inference slot
    ///
    /// The slot keeps its permit until dropped, so a caller can hold it
    /// across invoke and publish to keep outputs in arrival order.
    pub async fn acquire(&self) -> Result<InferenceSlot> {
        let agent = self.agent.get().cloned().ok_or(BridgeError::NotReady)?;
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::Inference("inference gate closed".to_string()))?;
        Ok(InferenceSlot {
            agent,
            timeout: self.timeout,
            _permit: permit,
        })
    }

    /// Run one observation through the agent
    pub async fn invoke(&self, observation: &Observation) -> Result<Action> {
        self.acquire().await?.invoke(observation).await
    }

    /// Stop handing out new slots
    pub fn close(&self) {
        self.gate.close();
    }
}

/// A reserved inference slot, holding one permit of the concurrency gate
pub struct InferenceSlot {
    agent: Arc<dyn Agent>,
    timeout: Option<Duration>,
    _permit: OwnedSemaphorePermit,
}

impl InferenceSlot {
    /// Execute the agent on the observation's vector (fixed field order)
    pub async fn invoke(&self, observation: &Observation) -> Result<Action> {
        let vector = observation.to_vector();
        let call = self.agent.execute(&vector);

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                BridgeError::Inference(format!("agent did not respond within {:?}", limit))
            })?,
            None => call.await,
        };

        let action = outcome.map_err(|e| BridgeError::Inference(e.to_string()))?;
        if !action.is_finite() {
            return Err(BridgeError::Inference(format!(
                "agent '{}' produced a non-finite action: {:?}",
                self.agent.name(),
                action
            )));
        }
        tracing::debug!(?action, "Generated action");
        Ok(action)
    }
}
