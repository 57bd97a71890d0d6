//! Downstream actions for classified telemetry.
//!
//! After an event is decoded and classified, the worker hands it to a
//! [`TelemetrySink`]. The sink's error decides what happens to the entry:
//!
//! - `Ok(())`: the entry is acknowledged
//! - [`SinkError::Transient`]: the entry stays pending and is retried after
//!   reclaim, up to the configured retry limit
//! - [`SinkError::Rejected`]: the entry is dead-lettered immediately
//!
//! ## Creating Custom Sinks
//!
//! ```rust,ignore
//! use telemetry_pipeline::sink::{SinkError, TelemetrySink};
//! use telemetry_pipeline::{Classification, TelemetryEvent};
//! use async_trait::async_trait;
//!
//! struct AlertSink;
//!
//! #[async_trait]
//! impl TelemetrySink for AlertSink {
//!     fn name(&self) -> &str {
//!         "alert"
//!     }
//!
//!     async fn deliver(&self, event: &TelemetryEvent, class: Classification) -> Result<(), SinkError> {
//!         // page someone
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::anomaly::Classification;
use crate::event::TelemetryEvent;

/// Errors a sink may report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Worth retrying later (downstream unavailable, timeout)
    #[error("transient failure: {0}")]
    Transient(String),

    /// Will never succeed for this event
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Action applied to every successfully classified event.
///
/// Sinks must be `Send + Sync`; one instance is shared by the processing loop
/// and the reclaim task.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        event: &TelemetryEvent,
        classification: Classification,
    ) -> Result<(), SinkError>;
}

/// A sink that records readings as structured logs. Anomalies log at `warn`.
#[derive(Debug, Clone)]
pub struct LogSink {
    prefix: String,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            prefix: "telemetry".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        event: &TelemetryEvent,
        classification: Classification,
    ) -> Result<(), SinkError> {
        match classification {
            Classification::Anomalous => warn!(
                prefix = %self.prefix,
                device_id = %event.device_id(),
                event_type = %event.event_type(),
                reading = event.reading(),
                timestamp = event.timestamp(),
                "[{}] Anomalous reading from {}",
                self.prefix,
                event.device_id()
            ),
            _ => debug!(
                prefix = %self.prefix,
                device_id = %event.device_id(),
                event_type = %event.event_type(),
                reading = event.reading(),
                classification = classification.as_str(),
                "[{}] Reading processed",
                self.prefix
            ),
        }
        Ok(())
    }
}
