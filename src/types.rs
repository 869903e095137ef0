//! Core types for the observation/action bridge
//!
//! Wire payloads are JSON. Field names of `Observation` are exact and
//! case-sensitive, matching what sensor publishers emit.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Topic the bridge subscribes to for incoming observations
pub const OBSERVATION_TOPIC: &str = "agent/observation";

/// Topic the bridge publishes computed actions to
pub const ACTION_TOPIC: &str = "agent/action";

/// Delivery guarantee used on both topics
pub const BRIDGE_QOS: QoS = QoS::ExactlyOnce;

/// Observation field names in the order the agent expects them
pub const OBSERVATION_FIELDS: [&str; 8] = [
    "T",
    "Tc",
    "Ca",
    "Cref",
    "Tref",
    "Conc_Error",
    "Eps_Yield",
    "Cb_Prod",
];

/// Sensor reading forwarded to the agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "T")]
    pub t: f64,
    #[serde(rename = "Tc")]
    pub tc: f64,
    #[serde(rename = "Ca")]
    pub ca: f64,
    #[serde(rename = "Cref")]
    pub cref: f64,
    #[serde(rename = "Tref")]
    pub tref: f64,
    #[serde(rename = "Conc_Error")]
    pub conc_error: f64,
    #[serde(rename = "Eps_Yield")]
    pub eps_yield: f64,
    #[serde(rename = "Cb_Prod")]
    pub cb_prod: f64,
}

impl Observation {
    /// Build an observation from values ordered as `OBSERVATION_FIELDS`
    pub fn from_vector(v: [f64; 8]) -> Self {
        Self {
            t: v[0],
            tc: v[1],
            ca: v[2],
            cref: v[3],
            tref: v[4],
            conc_error: v[5],
            eps_yield: v[6],
            cb_prod: v[7],
        }
    }

    /// Numeric vector in `OBSERVATION_FIELDS` order
    pub fn to_vector(&self) -> [f64; 8] {
        [
            self.t,
            self.tc,
            self.ca,
            self.cref,
            self.tref,
            self.conc_error,
            self.eps_yield,
            self.cb_prod,
        ]
    }
}

/// Inbound message body: `{"observation": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationMessage {
    pub observation: Observation,
}

/// Control decision produced by the agent
///
/// Serializes as a bare number or an array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Action {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Action {
    /// Flatten into a list of values
    pub fn values(&self) -> Vec<f64> {
        match self {
            Action::Scalar(v) => vec![*v],
            Action::Vector(v) => v.clone(),
        }
    }

    /// Whether every value is a finite number (JSON has no NaN or infinity)
    pub fn is_finite(&self) -> bool {
        match self {
            Action::Scalar(v) => v.is_finite(),
            Action::Vector(v) => v.iter().all(|x| x.is_finite()),
        }
    }
}

impl From<f64> for Action {
    fn from(v: f64) -> Self {
        Action::Scalar(v)
    }
}

impl From<Vec<f64>> for Action {
    fn from(v: Vec<f64>) -> Self {
        Action::Vector(v)
    }
}

/// Outbound message body: `{"action": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action: Action,
}

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    #[default]
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A message on the wire, inbound or outbound
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }
}

/// Broker session state, driven by network events only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Network events delivered from a provider's network loop
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Session (re)established and subscriptions reissued
    Connected { session_present: bool },
    /// Message received on a subscribed topic
    Message(Envelope),
    /// Session lost; the provider is retrying
    Disconnected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Observation {
        Observation::from_vector([300.0, 250.0, 7.5, 9.0, 280.0, 1.2, 10.0, 3.3])
    }

    #[test]
    fn test_observation_vector_order() {
        let obs = sample();
        assert_eq!(obs.t, 300.0);
        assert_eq!(obs.conc_error, 1.2);
        assert_eq!(
            obs.to_vector(),
            [300.0, 250.0, 7.5, 9.0, 280.0, 1.2, 10.0, 3.3]
        );
    }

    #[test]
    fn test_observation_uses_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), OBSERVATION_FIELDS.len());
        for name in OBSERVATION_FIELDS {
            assert!(obj.contains_key(name), "missing {}", name);
        }
        assert_eq!(json["Cb_Prod"], 3.3);
    }

    #[test]
    fn test_action_message_scalar() {
        let msg = ActionMessage {
            action: Action::Scalar(-2.5),
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"action":-2.5}"#);
    }

    #[test]
    fn test_action_message_vector() {
        let msg = ActionMessage {
            action: Action::Vector(vec![1.0, 0.5]),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"action":[1.0,0.5]}"#
        );
    }

    #[test]
    fn test_action_values() {
        assert_eq!(Action::from(3.0).values(), vec![3.0]);
        assert_eq!(Action::from(vec![1.0, 2.0]).values(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_action_finiteness() {
        assert!(Action::Scalar(-2.5).is_finite());
        assert!(!Action::Scalar(f64::INFINITY).is_finite());
        assert!(!Action::Vector(vec![1.0, f64::NAN]).is_finite());
        assert!(Action::Vector(vec![]).is_finite());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(u8::from(BRIDGE_QOS), 2);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
