//! Dead-letter routing for entries that cannot be processed.
//!
//! An entry is shunted by appending an immutable record to the dead-letter
//! stream and only then acknowledging the original. If the append fails the
//! original stays pending, so it is reclaimed later instead of being lost
//! between the two streams.
//!
//! # Wire format
//!
//! | Field         | Content                                  |
//! |---------------|------------------------------------------|
//! | `original_id` | id of the entry on the main stream       |
//! | `data`        | the original `data` bytes, unmodified    |
//! | `error`       | reason tag, e.g. `MALFORMED_JSON`        |
//! | `ts`          | epoch seconds when it was dead-lettered  |
//!
//! # Example
//!
//! ```rust,ignore
//! use telemetry_pipeline::dlq::{DeadLetterReason, DeadLetterRouter};
//!
//! let router = DeadLetterRouter::new(stream, "telemetry_stream", "telemetry_workers", "telemetry_dlq");
//! router.shunt(entry.id, payload, &DeadLetterReason::MalformedPayload).await?;
//!
//! // Later, inspect what was shunted
//! let failed = router.list(10).await?;
//! ```

use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::event::{now_epoch_secs, DATA_FIELD};
use crate::stream::{BrokerError, EntryId, Stream, StreamEntry};

/// Default dead-letter stream name.
pub const DEFAULT_DLQ_STREAM: &str = "telemetry_dlq";

/// Why an entry was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The `data` field is missing or is not a valid event
    MalformedPayload,
    /// The reading is above the physical-impossibility ceiling
    PhysicalImpossibility,
    /// A transient fault persisted past the retry limit
    RetryLimitExceeded,
    /// The sink refused the event
    ProcessingFault(String),
}

impl DeadLetterReason {
    /// Tag written to the `error` field.
    pub fn tag(&self) -> String {
        match self {
            DeadLetterReason::ProcessingFault(detail) => format!("PROCESSING_FAULT: {}", detail),
            other => other.kind().to_string(),
        }
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterReason::MalformedPayload => "MALFORMED_JSON",
            DeadLetterReason::PhysicalImpossibility => "PHYSICAL_IMPOSSIBILITY_THRESHOLD",
            DeadLetterReason::RetryLimitExceeded => "RETRY_LIMIT_EXCEEDED",
            DeadLetterReason::ProcessingFault(_) => "PROCESSING_FAULT",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// A record on the dead-letter stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub original_id: EntryId,
    pub payload: Vec<u8>,
    pub reason: String,
    pub ts: f64,
}

impl DeadLetterEntry {
    /// Decode from dead-letter stream fields.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, BrokerError> {
        let text = |name: &str| -> Result<String, BrokerError> {
            let bytes = entry.field(name).ok_or_else(|| {
                BrokerError::Protocol(format!("dead-letter entry {} has no '{}'", entry.id, name))
            })?;
            String::from_utf8(bytes.to_vec())
                .map_err(|_| BrokerError::Protocol(format!("'{}' is not UTF-8", name)))
        };

        Ok(Self {
            original_id: text("original_id")?.parse()?,
            payload: entry.field(DATA_FIELD).unwrap_or_default().to_vec(),
            reason: text("error")?,
            ts: text("ts")?
                .parse()
                .map_err(|_| BrokerError::Protocol("'ts' is not a number".to_string()))?,
        })
    }
}

/// Moves failed entries from the main stream to the dead-letter stream.
#[derive(Clone)]
pub struct DeadLetterRouter {
    stream: Arc<dyn Stream>,
    main_stream: String,
    group: String,
    dlq_stream: String,
}

impl DeadLetterRouter {
    pub fn new(
        stream: Arc<dyn Stream>,
        main_stream: impl Into<String>,
        group: impl Into<String>,
        dlq_stream: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            main_stream: main_stream.into(),
            group: group.into(),
            dlq_stream: dlq_stream.into(),
        }
    }

    /// Write a dead-letter record, then acknowledge the original entry.
    ///
    /// Returns the id of the dead-letter record. If the record cannot be
    /// written the original is left pending.
    pub async fn shunt(
        &self,
        original_id: EntryId,
        payload: &[u8],
        reason: &DeadLetterReason,
    ) -> Result<EntryId, BrokerError> {
        let original = original_id.to_string();
        let tag = reason.tag();
        let ts = format!("{:.6}", now_epoch_secs());

        let dlq_id = self
            .stream
            .append(
                &self.dlq_stream,
                &[
                    ("original_id", original.as_bytes()),
                    (DATA_FIELD, payload),
                    ("error", tag.as_bytes()),
                    ("ts", ts.as_bytes()),
                ],
            )
            .await
            .map_err(|e| {
                error!(original_id = %original, error = %e, "Failed to write dead-letter record");
                e
            })?;

        match self.stream.ack(&self.main_stream, &self.group, original_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(original_id = %original, "Dead-lettered entry was no longer pending");
            }
            Err(e) => {
                // record already written; a later reclaim may write a duplicate
                error!(original_id = %original, error = %e, "Failed to ack dead-lettered entry");
                return Err(e);
            }
        }

        info!(
            dlq_id = %dlq_id,
            original_id = %original,
            reason = %tag,
            "Entry moved to dead-letter stream"
        );

        Ok(dlq_id)
    }

    /// Number of records on the dead-letter stream.
    pub async fn count(&self) -> Result<u64, BrokerError> {
        self.stream.len(&self.dlq_stream).await
    }

    /// The oldest `limit` dead-letter records.
    pub async fn list(&self, limit: usize) -> Result<Vec<(EntryId, DeadLetterEntry)>, BrokerError> {
        self.stream
            .range(&self.dlq_stream, limit)
            .await?
            .iter()
            .map(|entry| Ok((entry.id, DeadLetterEntry::from_entry(entry)?)))
            .collect()
    }
}
