//! Agent capabilities — the opaque `load` and `execute` seams
//!
//! The bridge never looks inside an agent. It loads one handle from a
//! checkpoint at startup and then only calls `execute` through the
//! `InferenceInvoker`.
//!
//! `LinearPolicy` is a checkpoint-backed agent that computes
//! `action = clamp(W · observation + b)`. It lets the bridge run without an
//! external agent runtime and gives tests a deterministic agent.

use crate::error::AgentError;
use crate::types::{Action, OBSERVATION_FIELDS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Opaque inference capability
#[async_trait]
pub trait Agent: Send + Sync {
    /// Compute an action for one observation vector
    async fn execute(&self, observation: &[f64]) -> Result<Action, AgentError>;

    /// Whether `execute` may run concurrently on the same handle
    ///
    /// Defaults to `false`; the invoker then serializes all calls.
    fn is_reentrant(&self) -> bool {
        false
    }

    /// Agent name for logging
    fn name(&self) -> &str;
}

/// Opaque checkpoint loading capability
#[async_trait]
pub trait AgentLoader: Send + Sync {
    /// Create the process-wide agent handle from a checkpoint
    async fn load(&self, checkpoint: &Path, license: &str) -> Result<Arc<dyn Agent>, AgentError>;
}

/// On-disk checkpoint format for `LinearPolicy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearCheckpoint {
    /// One row of 8 weights per action output
    pub weights: Vec<Vec<f64>>,

    /// One bias per action output
    pub bias: Vec<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_low: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_high: Option<f64>,

    /// The policy is pure arithmetic, so it may declare itself reentrant
    #[serde(default)]
    pub reentrant: bool,
}

/// Linear control policy loaded from a JSON checkpoint
#[derive(Debug, Clone)]
pub struct LinearPolicy {
    checkpoint: LinearCheckpoint,
}

impl LinearPolicy {
    /// Validate a checkpoint and build the policy
    pub fn new(checkpoint: LinearCheckpoint) -> Result<Self, AgentError> {
        let invalid = |reason: String| AgentError::Checkpoint {
            path: "<memory>".to_string(),
            reason,
        };

        if checkpoint.weights.is_empty() {
            return Err(invalid("checkpoint has no weight rows".to_string()));
        }
        if checkpoint.weights.len() != checkpoint.bias.len() {
            return Err(invalid(format!(
                "{} weight rows but {} bias terms",
                checkpoint.weights.len(),
                checkpoint.bias.len()
            )));
        }
        if let Some((row, w)) = checkpoint
            .weights
            .iter()
            .enumerate()
            .find(|(_, w)| w.len() != OBSERVATION_FIELDS.len())
        {
            return Err(invalid(format!(
                "weight row {} has {} entries, expected {}",
                row,
                w.len(),
                OBSERVATION_FIELDS.len()
            )));
        }
        if let (Some(lo), Some(hi)) = (checkpoint.action_low, checkpoint.action_high) {
            if lo > hi {
                return Err(invalid(format!("action_low {} > action_high {}", lo, hi)));
            }
        }

        Ok(Self { checkpoint })
    }

    /// Read and validate a checkpoint file
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let display = path.display().to_string();

        let json = std::fs::read_to_string(path).map_err(|e| AgentError::Checkpoint {
            path: display.clone(),
            reason: e.to_string(),
        })?;

        let checkpoint: LinearCheckpoint =
            serde_json::from_str(&json).map_err(|e| AgentError::Checkpoint {
                path: display.clone(),
                reason: format!("corrupt checkpoint: {}", e),
            })?;

        Self::new(checkpoint).map_err(|e| match e {
            AgentError::Checkpoint { reason, .. } => AgentError::Checkpoint {
                path: display,
                reason,
            },
            other => other,
        })
    }

    /// Number of action outputs
    pub fn outputs(&self) -> usize {
        self.checkpoint.bias.len()
    }

    fn clamp(&self, v: f64) -> f64 {
        let v = match self.checkpoint.action_low {
            Some(lo) => v.max(lo),
            None => v,
        };
        match self.checkpoint.action_high {
            Some(hi) => v.min(hi),
            None => v,
        }
    }
}

#[async_trait]
impl Agent for LinearPolicy {
    async fn execute(&self, observation: &[f64]) -> Result<Action, AgentError> {
        if observation.len() != OBSERVATION_FIELDS.len() {
            return Err(AgentError::DimensionMismatch {
                expected: OBSERVATION_FIELDS.len(),
                actual: observation.len(),
            });
        }
        if let Some(i) = observation.iter().position(|v| !v.is_finite()) {
            return Err(AgentError::Execution(format!(
                "non-finite input for '{}'",
                OBSERVATION_FIELDS[i]
            )));
        }

        let mut out: Vec<f64> = self
            .checkpoint
            .weights
            .iter()
            .zip(&self.checkpoint.bias)
            .map(|(row, b)| {
                let dot: f64 = row.iter().zip(observation).map(|(w, x)| w * x).sum();
                self.clamp(dot + b)
            })
            .collect();

        if let Some(i) = out.iter().position(|v| !v.is_finite()) {
            return Err(AgentError::Execution(format!(
                "action output {} is not finite ({})",
                i, out[i]
            )));
        }

        Ok(if out.len() == 1 {
            Action::Scalar(out.remove(0))
        } else {
            Action::Vector(out)
        })
    }

    fn is_reentrant(&self) -> bool {
        self.checkpoint.reentrant
    }

    fn name(&self) -> &str {
        "linear-policy"
    }
}

/// Loads `LinearPolicy` checkpoints from disk
#[derive(Debug, Clone, Default)]
pub struct LinearPolicyLoader;

#[async_trait]
impl AgentLoader for LinearPolicyLoader {
    async fn load(&self, checkpoint: &Path, license: &str) -> Result<Arc<dyn Agent>, AgentError> {
        if license.trim().is_empty() {
            return Err(AgentError::License("license value is empty".to_string()));
        }

        let policy = LinearPolicy::from_file(checkpoint)?;

        tracing::info!(
            checkpoint = %checkpoint.display(),
            outputs = policy.outputs(),
            reentrant = policy.is_reentrant(),
            "Agent checkpoint loaded"
        );

        Ok(Arc::new(policy))
    }
}
