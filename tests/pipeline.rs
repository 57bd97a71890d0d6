//! End-to-end behavior of producer, worker and dead-letter stream over the
//! in-memory broker.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use telemetry_pipeline::metrics::Metrics;
use telemetry_pipeline::shutdown::ShutdownSignal;
use telemetry_pipeline::sink::{SinkError, TelemetrySink};
use telemetry_pipeline::{
    AnomalyDetector, Classification, IngestError, InMemoryStream, Producer, Stream,
    TelemetryEvent, ValidationError, Validator, Worker, WorkerSettings,
};

const MAIN: &str = "telemetry_stream";
const DLQ: &str = "telemetry_dlq";
const GROUP: &str = "telemetry_workers";

struct Pipeline {
    stream: Arc<InMemoryStream>,
    producer: Producer,
    worker: Worker,
    metrics: Arc<Metrics>,
}

fn settings(consumer: &str, visibility_timeout: Duration) -> WorkerSettings {
    WorkerSettings {
        stream_name: MAIN.to_string(),
        dlq_stream_name: DLQ.to_string(),
        group: GROUP.to_string(),
        consumer: consumer.to_string(),
        batch_size: 10,
        read_block: Duration::from_millis(10),
        retry_limit: 3,
        visibility_timeout,
        reclaim_interval: Duration::from_millis(10),
        broker_retry_backoff: Duration::from_millis(10),
    }
}

async fn pipeline() -> Pipeline {
    pipeline_with(Duration::ZERO).await
}

async fn pipeline_with(visibility_timeout: Duration) -> Pipeline {
    let stream = Arc::new(InMemoryStream::new());
    let metrics = Arc::new(Metrics::new());
    let producer = Producer::new(
        Validator::new(["VIBRATION", "TEMPERATURE"]),
        stream.clone(),
        MAIN,
        metrics.clone(),
    );
    let worker = Worker::new(
        stream.clone(),
        settings("worker-1", visibility_timeout),
        AnomalyDetector::new(22.0, 500.0),
        metrics.clone(),
    )
    .unwrap();
    worker.prepare().await.unwrap();

    Pipeline {
        stream,
        producer,
        worker,
        metrics,
    }
}

/// Always fails with a transient fault.
struct DownstreamTimeout {
    attempts: AtomicUsize,
}

#[async_trait]
impl TelemetrySink for DownstreamTimeout {
    fn name(&self) -> &str {
        "timeout"
    }

    async fn deliver(&self, _: &TelemetryEvent, _: Classification) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Transient("timed out".to_string()))
    }
}

#[tokio::test]
async fn normal_reading_is_acked() {
    let p = pipeline().await;

    p.producer
        .ingest(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": 15.4}))
        .await
        .unwrap();
    let report = p.worker.process_batch().await.unwrap();

    assert_eq!(report.acked, 1);
    let stats = p.metrics.snapshot();
    assert_eq!(stats.processed_success, 1);
    assert_eq!(stats.anomalies_detected, 0);
    assert!(p.stream.pending_ids(MAIN, GROUP).is_empty());
}

#[tokio::test]
async fn anomalous_reading_is_acked_and_counted() {
    let p = pipeline().await;

    p.producer
        .ingest(&json!({"device_id": "DEV-002", "type": "VIBRATION", "reading": 30.0}))
        .await
        .unwrap();
    p.worker.process_batch().await.unwrap();

    let stats = p.metrics.snapshot();
    assert_eq!(stats.processed_success, 1);
    assert_eq!(stats.anomalies_detected, 1);
    assert_eq!(p.stream.len(DLQ).await.unwrap(), 0);
}

#[tokio::test]
async fn impossible_reading_is_dead_lettered() {
    let p = pipeline().await;

    p.producer
        .ingest(&json!({"device_id": "DEV-003", "type": "VIBRATION", "reading": 600.0}))
        .await
        .unwrap();
    let report = p.worker.process_batch().await.unwrap();

    assert_eq!(report.dead_lettered, 1);
    let records = p.worker.dead_letters().list(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.reason, "PHYSICAL_IMPOSSIBILITY_THRESHOLD");

    let original = TelemetryEvent::decode(&records[0].1.payload).unwrap();
    assert_eq!(original.device_id(), "DEV-003");

    assert!(p.stream.pending_ids(MAIN, GROUP).is_empty());
    assert_eq!(p.metrics.snapshot().processed_success, 0);
}

#[tokio::test]
async fn unknown_type_never_reaches_the_stream() {
    let p = pipeline().await;

    let err = p
        .producer
        .ingest(&json!({"device_id": "DEV-004", "type": "SEISMIC"}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IngestError::Validation(ValidationError::UnknownEventType { .. })
    ));
    assert_eq!(p.stream.len(MAIN).await.unwrap(), 0);
}

#[tokio::test]
async fn every_valid_event_is_either_processed_or_dead_lettered() {
    let p = pipeline().await;
    let readings = [0.0, 15.4, 22.0, 22.1, 499.9, 500.0, 500.1, 600.0];

    for (i, reading) in readings.iter().enumerate() {
        p.producer
            .ingest(&json!({"device_id": format!("DEV-{i}"), "type": "TEMPERATURE", "reading": reading}))
            .await
            .unwrap();
    }
    let report = p.worker.process_batch().await.unwrap();

    let stats = p.metrics.snapshot();
    let dead = p.stream.len(DLQ).await.unwrap();
    assert_eq!(report.total(), readings.len());
    assert_eq!(stats.processed_success + dead, readings.len() as u64);
    assert_eq!(dead, 2);
    assert_eq!(stats.anomalies_detected, 3);
}

#[tokio::test]
async fn malformed_entry_dead_lettered_on_first_delivery() {
    let p = pipeline().await;
    p.stream
        .append(MAIN, &[("data", b"{\"device_id\":".as_slice())])
        .await
        .unwrap();

    p.worker.process_batch().await.unwrap();

    let records = p.worker.dead_letters().list(10).await.unwrap();
    assert_eq!(records[0].1.reason, "MALFORMED_JSON");
    assert_eq!(p.worker.reclaim_once().await.unwrap().total(), 0);
}

#[tokio::test]
async fn retries_exhaust_only_after_limit() {
    let p = pipeline().await;
    let sink = Arc::new(DownstreamTimeout {
        attempts: AtomicUsize::new(0),
    });
    let worker = p.worker.with_sink(sink.clone());

    let receipt = p
        .producer
        .ingest(&json!({"device_id": "DEV-005", "type": "VIBRATION", "reading": 5.0}))
        .await
        .unwrap();
    assert_eq!(receipt.device_id, "DEV-005");

    worker.process_batch().await.unwrap();
    let id = p.stream.pending_ids(MAIN, GROUP)[0];

    for expected in 2..=3 {
        worker.reclaim_once().await.unwrap();
        assert_eq!(
            p.stream.delivery_count(MAIN, GROUP, id).await.unwrap(),
            Some(expected)
        );
        assert_eq!(p.stream.len(DLQ).await.unwrap(), 0);
    }

    worker.reclaim_once().await.unwrap();
    assert_eq!(p.stream.len(DLQ).await.unwrap(), 1);
    assert_eq!(p.stream.delivery_count(MAIN, GROUP, id).await.unwrap(), None);
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);

    let records = worker.dead_letters().list(1).await.unwrap();
    assert_eq!(records[0].1.original_id, id);
    assert_eq!(records[0].1.reason, "RETRY_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn stale_entry_moves_to_another_worker() {
    let p = pipeline().await;
    p.producer
        .ingest(&json!({"device_id": "DEV-006", "type": "VIBRATION", "reading": 3.0}))
        .await
        .unwrap();

    // worker-1 takes the entry and goes silent
    let delivered = p
        .stream
        .read_group(MAIN, GROUP, "worker-1", 10, Duration::ZERO)
        .await
        .unwrap();
    let id = delivered[0].id;

    let other = Worker::new(
        p.stream.clone(),
        settings("worker-2", Duration::ZERO),
        AnomalyDetector::new(22.0, 500.0),
        p.metrics.clone(),
    )
    .unwrap();

    let report = other.reclaim_once().await.unwrap();
    assert_eq!(report.acked, 1);
    assert!(p.stream.pending_owner(MAIN, GROUP, id).is_none());

    // the original owner acking late is a no-op
    assert!(!p.stream.ack(MAIN, GROUP, id).await.unwrap());
    assert_eq!(p.metrics.snapshot().processed_success, 1);
}

#[tokio::test]
async fn fresh_entries_are_not_reclaimed() {
    let p = pipeline().await;
    let patient = Worker::new(
        p.stream.clone(),
        settings("worker-2", Duration::from_secs(30)),
        AnomalyDetector::new(22.0, 500.0),
        p.metrics.clone(),
    )
    .unwrap();

    p.producer
        .ingest(&json!({"device_id": "DEV-007", "type": "VIBRATION", "reading": 3.0}))
        .await
        .unwrap();
    p.stream
        .read_group(MAIN, GROUP, "worker-1", 10, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(patient.reclaim_once().await.unwrap().total(), 0);
    assert_eq!(p.stream.pending_ids(MAIN, GROUP).len(), 1);
}

#[tokio::test]
async fn running_worker_drains_stream_and_stops() {
    let p = pipeline_with(Duration::from_secs(30)).await;
    let worker = Arc::new(p.worker);
    let shutdown = ShutdownSignal::new();

    let run = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };
    let reclaim = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run_reclaimer(shutdown).await })
    };

    for reading in [10.0, 25.0, 900.0] {
        p.producer
            .ingest(&json!({"device_id": "DEV-008", "type": "VIBRATION", "reading": reading}))
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while p.metrics.snapshot().processed_success < 2 || p.stream.len(DLQ).await.unwrap() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), async {
        run.await.unwrap();
        reclaim.await.unwrap();
    })
    .await
    .unwrap();

    assert!(p.stream.pending_ids(MAIN, GROUP).is_empty());
    assert_eq!(p.metrics.snapshot().anomalies_detected, 1);
}
