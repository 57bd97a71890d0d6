//! Core telemetry types.
//!
//! A [`TelemetryEvent`] is the only shape of data that flows past the edge of
//! the pipeline. It is built by the [`Validator`](crate::validate::Validator)
//! from untyped request bodies, serialized into the `data` field of a main
//! stream entry, and decoded again by the worker.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Name of the stream entry field holding the serialized event.
pub const DATA_FIELD: &str = "data";

/// A single sensor reading.
///
/// # Wire format
///
/// ```json
/// {
///   "device_id": "DEV-001",
///   "type": "VIBRATION",
///   "reading": 15.4,
///   "timestamp": 1733911200.25
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    device_id: String,

    #[serde(rename = "type")]
    event_type: String,

    reading: f64,

    /// Seconds since the Unix epoch
    timestamp: f64,
}

impl TelemetryEvent {
    pub(crate) fn new(
        device_id: impl Into<String>,
        event_type: impl Into<String>,
        reading: f64,
        timestamp: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            event_type: event_type.into(),
            reading,
            timestamp,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn reading(&self) -> f64 {
        self.reading
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Serialize for the `data` field of a stream entry.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the `data` field of a stream entry.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Current time as fractional epoch seconds.
pub fn now_epoch_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
