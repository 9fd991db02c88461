//! JSON payloads exchanged with the broker
//!
//! State payloads always carry the same ten keys; absent values are written as `null`
//! so consumers can rely on key presence. Command payloads are decoded leniently:
//! unknown keys are ignored, recognised keys must hold numbers.

use crate::mesh::Unit;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Keys of every state payload, in serialization order
pub const STATE_KEYS: [&str; 10] = [
    "on",
    "online",
    "colorsource",
    "dimmer",
    "rgb",
    "slider",
    "temperature",
    "vertical",
    "white",
    "xy",
];

/// Recognised command keys, in the order they are applied
pub const COMMAND_PRECEDENCE: [&str; 3] = ["dimmer", "temperature", "vertical"];

/// Retained state message published for one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub on: bool,
    pub online: bool,
    pub colorsource: Option<String>,
    pub dimmer: Option<u8>,
    /// `#rrggbb`
    pub rgb: Option<String>,
    pub slider: Option<u8>,
    pub temperature: Option<u32>,
    pub vertical: Option<u8>,
    pub white: Option<u8>,
    pub xy: Option<[f64; 2]>,
}

impl From<&Unit> for StatePayload {
    fn from(unit: &Unit) -> Self {
        let state = &unit.state;
        Self {
            on: unit.on,
            online: unit.online,
            colorsource: state.colorsource.map(|source| source.to_string()),
            dimmer: state.dimmer,
            rgb: state.rgb.map(|rgb| rgb.to_hex()),
            slider: state.slider,
            temperature: state.temperature,
            vertical: state.vertical,
            white: state.white,
            xy: state.xy.map(|(x, y)| [x, y]),
        }
    }
}

/// Serialize the state payload for `unit`
pub fn encode_state(unit: &Unit) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(&StatePayload::from(unit)).map_err(PayloadError::Encode)
}

/// One requested property change, decoded from a command payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyChange {
    Dimmer(f64),
    Temperature(f64),
    Vertical(f64),
}

impl PropertyChange {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyChange::Dimmer(_) => "dimmer",
            PropertyChange::Temperature(_) => "temperature",
            PropertyChange::Vertical(_) => "vertical",
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            PropertyChange::Dimmer(v) | PropertyChange::Temperature(v) | PropertyChange::Vertical(v) => v,
        }
    }

    fn from_key(key: &str, value: f64) -> Option<Self> {
        match key {
            "dimmer" => Some(PropertyChange::Dimmer(value)),
            "temperature" => Some(PropertyChange::Temperature(value)),
            "vertical" => Some(PropertyChange::Vertical(value)),
            _ => None,
        }
    }
}

/// Decode a command payload into property changes ordered by [`COMMAND_PRECEDENCE`]
///
/// An object without recognised keys decodes to an empty list.
pub fn decode_command(payload: &[u8]) -> Result<Vec<PropertyChange>, PayloadError> {
    let value: Value = serde_json::from_slice(payload).map_err(PayloadError::Malformed)?;
    let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

    let mut changes = Vec::with_capacity(COMMAND_PRECEDENCE.len());
    for key in COMMAND_PRECEDENCE {
        let Some(raw) = object.get(key) else {
            continue;
        };
        let number = raw.as_f64().ok_or_else(|| PayloadError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        })?;
        if let Some(change) = PropertyChange::from_key(key, number) {
            changes.push(change);
        }
    }

    Ok(changes)
}

/// Payload encoding and decoding errors
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed JSON payload: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Command payload must be a JSON object")]
    NotAnObject,
    #[error("Value for '{key}' must be a number, got {value}")]
    InvalidValue { key: String, value: String },
    #[error("Failed to encode state payload: {0}")]
    Encode(#[source] serde_json::Error),
}
