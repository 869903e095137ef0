//! Inbound payload validation
//!
//! Turns raw broker payloads into typed observations. Decoding is pure: a
//! rejected payload yields a `DecodeError` and nothing is forwarded.

use crate::error::DecodeError;
use crate::types::{Observation, OBSERVATION_FIELDS};

/// Decode `{"observation": {<8 numeric fields>}}` from raw bytes
pub fn decode(payload: &[u8]) -> Result<Observation, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidEncoding)?;

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let observation = value
        .get("observation")
        .filter(|v| !v.is_null())
        .ok_or(DecodeError::MissingObservation)?;

    let fields = observation.as_object().ok_or(DecodeError::NotAnObject)?;

    let mut vector = [0.0_f64; 8];
    for (slot, name) in vector.iter_mut().zip(OBSERVATION_FIELDS) {
        let raw = fields.get(name).ok_or(DecodeError::MissingField(name))?;
        // as_f64 rejects numeric strings, booleans and null
        *slot = raw
            .as_f64()
            .ok_or(DecodeError::NonNumeric { field: name })?;
    }

    Ok(Observation::from_vector(vector))
}
