//! Action response publishing

use crate::error::{BridgeError, Result};
use crate::provider::BrokerProvider;
use crate::types::{Action, ActionMessage, Envelope, ACTION_TOPIC, BRIDGE_QOS};
use std::sync::Arc;

/// Serializes actions into `{"action": ...}` and sends them on the action topic
pub struct ResponsePublisher {
    provider: Arc<dyn BrokerProvider>,
}

impl ResponsePublisher {
    pub fn new(provider: Arc<dyn BrokerProvider>) -> Self {
        Self { provider }
    }

    /// Build the outbound envelope for an action
    ///
    /// Non-finite values have no JSON number form and are rejected as
    /// `BridgeError::Inference` instead of being written as `null`.
    pub fn encode(action: &Action) -> Result<Envelope> {
        if !action.is_finite() {
            return Err(BridgeError::Inference(format!(
                "agent produced a non-finite action: {:?}",
                action
            )));
        }
        let payload = serde_json::to_vec(&ActionMessage {
            action: action.clone(),
        })?;
        Ok(Envelope::new(ACTION_TOPIC, payload, BRIDGE_QOS))
    }

    /// Publish an action, logging instead of failing
    ///
    /// Returns whether the message was handed to the broker.
    pub async fn publish(&self, action: &Action) -> bool {
        match self.try_publish(action).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, ?action, "Action lost: publish failed");
                false
            }
        }
    }

    /// Publish an action, surfacing failures as `BridgeError::Publish`
    pub async fn try_publish(&self, action: &Action) -> Result<()> {
        let envelope = Self::encode(action).map_err(|e| match e {
            BridgeError::Inference(_) => e,
            other => BridgeError::Publish {
                topic: ACTION_TOPIC.to_string(),
                reason: other.to_string(),
            },
        })?;

        tracing::info!(
            topic = ACTION_TOPIC,
            payload = %String::from_utf8_lossy(&envelope.payload),
            "Publishing action"
        );
        self.provider.publish(envelope).await
    }
}
