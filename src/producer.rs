//! Producer side: validate one request body and append it to the main stream.
//!
//! There is no internal retry. A failed append is reported to the caller,
//! who decides whether to try again; repeated calls produce repeated,
//! independently valid entries.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::DATA_FIELD;
use crate::metrics::{Metrics, Status};
use crate::stream::{BrokerError, Stream};
use crate::validate::{ValidationError, Validator};

/// Why an ingest call failed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returned to the producer once its event is durably appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedReceipt {
    pub device_id: String,
}

/// Validates inbound events and appends them to the main stream.
#[derive(Clone)]
pub struct Producer {
    validator: Validator,
    stream: Arc<dyn Stream>,
    stream_name: String,
    metrics: Arc<Metrics>,
}

impl Producer {
    pub fn new(
        validator: Validator,
        stream: Arc<dyn Stream>,
        stream_name: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            validator,
            stream,
            stream_name: stream_name.into(),
            metrics,
        }
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Validate `raw` and append it. Exactly one append per successful call.
    pub async fn ingest(&self, raw: &Value) -> Result<AcceptedReceipt, IngestError> {
        let start = Instant::now();
        let result = self.try_ingest(raw).await;

        let status = if result.is_ok() {
            Status::Success
        } else {
            Status::Error
        };
        self.metrics.record_ingest(status, start.elapsed());

        result
    }

    async fn try_ingest(&self, raw: &Value) -> Result<AcceptedReceipt, IngestError> {
        let event = self.validator.validate(raw).map_err(|e| {
            debug!(error = %e, "Rejected event");
            e
        })?;

        let data = event.encode()?;

        let id = self
            .stream
            .append(&self.stream_name, &[(DATA_FIELD, data.as_bytes())])
            .await
            .map_err(|e| {
                error!(
                    device_id = %event.device_id(),
                    error = %e,
                    "Failed to append event to stream"
                );
                e
            })?;

        info!(
            id = %id,
            device_id = %event.device_id(),
            event_type = %event.event_type(),
            "Event ingested"
        );

        Ok(AcceptedReceipt {
            device_id: event.device_id().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TelemetryEvent;
    use crate::stream::InMemoryStream;
    use serde_json::json;

    const STREAM: &str = "telemetry_stream";

    fn producer() -> (Arc<InMemoryStream>, Producer) {
        let stream = Arc::new(InMemoryStream::new());
        let producer = Producer::new(
            Validator::new(["VIBRATION", "TEMPERATURE"]),
            stream.clone(),
            STREAM,
            Arc::new(Metrics::new()),
        );
        (stream, producer)
    }

    #[tokio::test]
    async fn test_ingest_appends_one_entry() {
        let (stream, producer) = producer();

        let receipt = producer
            .ingest(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": 15.4}))
            .await
            .unwrap();
        assert_eq!(receipt.device_id, "DEV-001");

        let entries = stream.range(STREAM, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let event = TelemetryEvent::decode(entries[0].payload().unwrap()).unwrap();
        assert_eq!(event.device_id(), "DEV-001");
        assert_eq!(event.reading(), 15.4);

        let snapshot = producer.metrics().snapshot();
        assert_eq!(snapshot.ingested_success, 1);
        assert_eq!(snapshot.ingest_latency_samples, 1);
    }

    #[tokio::test]
    async fn test_rejected_event_never_appended() {
        let (stream, producer) = producer();

        let err = producer
            .ingest(&json!({"device_id": "DEV-004", "type": "SEISMIC"}))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::UnknownEventType { .. })
        ));
        assert_eq!(stream.len(STREAM).await.unwrap(), 0);
        assert_eq!(producer.metrics().snapshot().ingested_error, 1);
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces_without_retry() {
        let (stream, producer) = producer();
        stream.set_unavailable(true);

        let err = producer
            .ingest(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": 1.0}))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Broker(_)));

        stream.set_unavailable(false);
        assert_eq!(stream.len(STREAM).await.unwrap(), 0);

        let snapshot = producer.metrics().snapshot();
        assert_eq!(snapshot.ingested_error, 1);
        assert_eq!(snapshot.ingested_success, 0);
        assert_eq!(snapshot.ingest_latency_samples, 1);
    }

    #[tokio::test]
    async fn test_duplicate_calls_produce_distinct_entries() {
        let (stream, producer) = producer();
        let body = json!({"device_id": "DEV-001", "type": "TEMPERATURE", "reading": 40.0, "timestamp": 1.0});

        producer.ingest(&body).await.unwrap();
        producer.ingest(&body).await.unwrap();

        let entries = stream.range(STREAM, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);
        assert_eq!(entries[0].payload(), entries[1].payload());
    }
}
