use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::error::DecodeError;

/// Structured payload as decoded from the wire
pub type Payload = Map<String, Value>;

/// Decodes an inbound frame into a JSON object
pub fn decode_payload(raw: &[u8]) -> Result<Payload, DecodeError> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(DecodeError::NotAnObject("null")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("bool")),
        Value::Number(_) => Err(DecodeError::NotAnObject("number")),
        Value::String(_) => Err(DecodeError::NotAnObject("string")),
        Value::Array(_) => Err(DecodeError::NotAnObject("array")),
    }
}

/// Default update shape published by the device
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Telemetry {
    pub id: String,
    pub timestamp: i64,
    pub number: f64,
    #[serde(rename = "ledA")]
    pub led_a: u8,
    #[serde(rename = "ledB")]
    pub led_b: u8,
}

impl Telemetry {
    /// Zeroed reading shown until the first update arrives
    pub fn placeholder(device_id: &str) -> Self {
        Self {
            id: device_id.to_string(),
            timestamp: 0,
            number: 0.0,
            led_a: 0,
            led_b: 0,
        }
    }

    fn into_payload(self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

/// Most recent inbound message; replaced as a whole on every good frame
#[derive(Clone, Debug, PartialEq)]
pub struct InboundRecord {
    pub payload: Payload,
    /// Topic of the message; empty until the first message arrives
    pub topic: String,
    pub received_at: Option<DateTime<Local>>,
    pub sequence: u64,
}

impl InboundRecord {
    pub fn initial(device_id: &str) -> Self {
        Self {
            payload: Telemetry::placeholder(device_id).into_payload(),
            topic: String::new(),
            received_at: None,
            sequence: 0,
        }
    }

    /// Builds the successor record for a freshly decoded message
    pub fn next(&self, topic: String, payload: Payload) -> Self {
        Self {
            payload,
            topic,
            received_at: Some(Local::now()),
            sequence: self.sequence + 1,
        }
    }

    pub fn has_arrived(&self) -> bool {
        self.received_at.is_some()
    }

    /// Typed view of the payload when it has the default update shape
    pub fn telemetry(&self) -> Option<Telemetry> {
        serde_json::from_value(Value::Object(self.payload.clone())).ok()
    }
}

impl fmt::Display for InboundRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.received_at {
            Some(at) => write!(
                f,
                "{} - {}: {}",
                at.format("%H:%M:%S"),
                self.topic,
                Value::Object(self.payload.clone())
            ),
            None => write!(f, "no message received yet"),
        }
    }
}

/// Commands understood by the device on its command topic
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceCommand {
    Toggle { device: String },
}

impl DeviceCommand {
    pub fn toggle(device: impl Into<String>) -> Self {
        DeviceCommand::Toggle {
            device: device.into(),
        }
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
