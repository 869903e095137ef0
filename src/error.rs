//! Error types for agent-bridge

use thiserror::Error;

/// Errors that can occur anywhere in the bridge
///
/// Only `FatalInit` is allowed to reach the process boundary. Every other
/// variant is logged at the point where it occurs and the bridge keeps running.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Broker unreachable or connection dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// Subscribe request rejected or could not be queued
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Inbound payload could not be turned into an observation
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Inference requested before the agent finished loading
    #[error("Agent is not ready for inference")]
    NotReady,

    /// Agent execution failed for one observation
    #[error("Inference error: {0}")]
    Inference(String),

    /// Outbound send failed
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Unrecoverable startup failure (checkpoint, credentials, broker)
    #[error("Fatal initialization error: {0}")]
    FatalInit(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons an inbound payload is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    InvalidEncoding,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload has no 'observation' field")]
    MissingObservation,

    #[error("'observation' is not a JSON object")]
    NotAnObject,

    #[error("observation is missing field '{0}'")]
    MissingField(&'static str),

    #[error("observation field '{field}' is not numeric")]
    NonNumeric { field: &'static str },
}

/// Errors raised by agent load and execute capabilities
#[derive(Debug, Error)]
pub enum AgentError {
    /// Checkpoint missing, unreadable or corrupt
    #[error("Checkpoint error ({path}): {reason}")]
    Checkpoint { path: String, reason: String },

    /// License/credential absent or rejected
    #[error("License error: {0}")]
    License(String),

    /// Input vector does not match the agent's expected width
    #[error("Expected {expected} inputs, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Execution failed inside the agent
    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
