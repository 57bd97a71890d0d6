//! Consumer worker: read, classify, then acknowledge or dead-letter.
//!
//! # State machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!  ┌──────┐     ┌─────────────┐  batch  ┌────────────┐      │
//!  │ Idle │────►│ BlockedRead │────────►│ Processing │──────┘ batch drained
//!  └──────┘     └─────────────┘         └────────────┘
//!     ▲          │ empty / broker error      │ per entry:
//!     └──────────┘ (bounded sleep)           ├─ Ack
//!                                            ├─ DeadLetter (dlq + ack)
//!                                            └─ Retry (left pending)
//! ```
//!
//! Any state moves to `Stopped` on shutdown. A blocking read is abandoned;
//! an entry already being processed is always finished first. Entries left
//! in a batch stay pending and are reclaimed later.
//!
//! A separate reclaim task ([`Worker::run_reclaimer`]) periodically takes
//! over entries whose visibility timeout has expired and pushes them through
//! the same per-entry path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::anomaly::{AnomalyDetector, Classification};
use crate::config::PipelineConfig;
use crate::dlq::{DeadLetterReason, DeadLetterRouter};
use crate::event::TelemetryEvent;
use crate::metrics::{Metrics, Status};
use crate::shutdown::ShutdownSignal;
use crate::sink::{LogSink, SinkError, TelemetrySink};
use crate::stream::{validate_key, BrokerError, Stream, StreamEntry};

/// Errors that stop a worker before it starts consuming.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Everything a worker needs to know about where and how to consume.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub stream_name: String,
    pub dlq_stream_name: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub read_block: Duration,
    pub retry_limit: u64,
    pub visibility_timeout: Duration,
    pub reclaim_interval: Duration,
    pub broker_retry_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &PipelineConfig, consumer: impl Into<String>) -> Self {
        let p = &config.processor;
        Self {
            stream_name: config.broker.stream_name.clone(),
            dlq_stream_name: config.broker.dlq_stream_name.clone(),
            group: p.consumer_group.clone(),
            consumer: consumer.into(),
            batch_size: p.batch_size,
            read_block: p.read_block(),
            retry_limit: p.retry_limit,
            visibility_timeout: p.visibility_timeout(),
            reclaim_interval: p.reclaim_interval(),
            broker_retry_backoff: p.broker_retry_backoff(),
        }
    }
}

/// Consumer name from configuration, hostname, or a random id.
pub fn consumer_name(configured: Option<&str>) -> String {
    if let Some(name) = configured.filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    format!("worker-{}", uuid::Uuid::new_v4())
}

/// What happened to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    DeadLettered(DeadLetterReason),
    /// Left pending after a transient fault; reclaim will retry it
    Deferred,
    /// A broker call failed; the entry stays pending
    Failed,
}

/// Per-batch tally of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub acked: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::DeadLettered(_) => self.dead_lettered += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.acked + self.dead_lettered + self.deferred + self.failed
    }
}

#[derive(Debug)]
enum WorkerState {
    Idle,
    BlockedRead,
    Processing(VecDeque<StreamEntry>),
    Stopped,
}

/// Decision for one entry, before any broker side effect.
#[derive(Debug)]
enum Disposition {
    Ack(Classification),
    DeadLetter(DeadLetterReason),
    Retry,
    Failed,
}

/// A consumer in a consumer group.
pub struct Worker {
    stream: Arc<dyn Stream>,
    detector: AnomalyDetector,
    dlq: DeadLetterRouter,
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<Metrics>,
    settings: WorkerSettings,
}

impl Worker {
    /// Build a worker. Fails if the stream layout cannot work at all.
    pub fn new(
        stream: Arc<dyn Stream>,
        settings: WorkerSettings,
        detector: AnomalyDetector,
        metrics: Arc<Metrics>,
    ) -> Result<Self, WorkerError> {
        for (label, name) in [
            ("stream", &settings.stream_name),
            ("dead-letter stream", &settings.dlq_stream_name),
            ("consumer group", &settings.group),
            ("consumer", &settings.consumer),
        ] {
            validate_key(name)
                .map_err(|reason| WorkerError::FatalConfig(format!("{} name: {}", label, reason)))?;
        }
        if settings.stream_name == settings.dlq_stream_name {
            return Err(WorkerError::FatalConfig(
                "dead-letter stream must differ from the main stream".to_string(),
            ));
        }
        if settings.batch_size == 0 {
            return Err(WorkerError::FatalConfig("batch size must be at least 1".to_string()));
        }

        let dlq = DeadLetterRouter::new(
            stream.clone(),
            settings.stream_name.clone(),
            settings.group.clone(),
            settings.dlq_stream_name.clone(),
        );

        Ok(Self {
            stream,
            detector,
            dlq,
            sink: Arc::new(LogSink::new()),
            metrics,
            settings,
        })
    }

    /// [`Worker::new`] followed by [`Worker::prepare`].
    pub async fn start(
        stream: Arc<dyn Stream>,
        settings: WorkerSettings,
        detector: AnomalyDetector,
        metrics: Arc<Metrics>,
    ) -> Result<Self, WorkerError> {
        let worker = Self::new(stream, settings, detector, metrics)?;
        worker.prepare().await?;
        Ok(worker)
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dlq
    }

    /// Create the consumer group if needed. Must succeed before consuming.
    ///
    /// A broker that rejects the stream key outright (wrong type, bad name)
    /// is reported as [`WorkerError::FatalConfig`]; connectivity problems
    /// come back as [`WorkerError::Broker`] and may be retried.
    pub async fn prepare(&self) -> Result<(), WorkerError> {
        match self
            .stream
            .ensure_group(&self.settings.stream_name, &self.settings.group)
            .await
        {
            Ok(()) => Ok(()),
            Err(BrokerError::Command(msg)) => Err(WorkerError::FatalConfig(format!(
                "cannot create group '{}' on stream '{}': {}",
                self.settings.group, self.settings.stream_name, msg
            ))),
            Err(e) => Err(WorkerError::Broker(e)),
        }
    }

    /// Consume until `shutdown` is triggered.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(
            stream = %self.settings.stream_name,
            consumer_group = %self.settings.group,
            consumer = %self.settings.consumer,
            "Listening for telemetry"
        );

        let mut state = WorkerState::Idle;
        loop {
            state = match state {
                WorkerState::Idle => {
                    if shutdown.is_shutdown() {
                        WorkerState::Stopped
                    } else {
                        WorkerState::BlockedRead
                    }
                }
                WorkerState::BlockedRead => self.blocked_read(&shutdown).await,
                WorkerState::Processing(mut batch) => {
                    if shutdown.is_shutdown() {
                        if !batch.is_empty() {
                            info!(
                                remaining = batch.len(),
                                "Shutdown requested, leaving rest of batch pending"
                            );
                        }
                        WorkerState::Stopped
                    } else {
                        match batch.pop_front() {
                            Some(entry) => {
                                self.process_entry(&entry).await;
                                WorkerState::Processing(batch)
                            }
                            None => WorkerState::Idle,
                        }
                    }
                }
                WorkerState::Stopped => break,
            };
        }

        let stats = self.metrics.snapshot();
        info!(
            processed = stats.processed_success,
            dead_lettered = stats.dead_lettered,
            anomalies = stats.anomalies_detected,
            "Worker stopped"
        );
    }

    async fn blocked_read(&self, shutdown: &ShutdownSignal) -> WorkerState {
        let read = self.stream.read_group(
            &self.settings.stream_name,
            &self.settings.group,
            &self.settings.consumer,
            self.settings.batch_size,
            self.settings.read_block,
        );

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Shutdown during blocking read, abandoning it");
                return WorkerState::Stopped;
            }
            result = read => result,
        };

        match result {
            Ok(batch) if batch.is_empty() => WorkerState::Idle,
            Ok(batch) => {
                debug!(count = batch.len(), "Read batch");
                WorkerState::Processing(batch.into())
            }
            Err(e) => {
                error!(error = %e, "Stream read failed");
                self.metrics.record_processed(Status::Error);
                self.backoff(shutdown).await;
                WorkerState::Idle
            }
        }
    }

    async fn backoff(&self, shutdown: &ShutdownSignal) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.broker_retry_backoff) => {}
            _ = shutdown.cancelled() => {}
        }
    }

    /// Periodically reclaim stale entries until `shutdown` is triggered.
    pub async fn run_reclaimer(&self, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.reclaim_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.reclaim(Some(&shutdown)).await {
                error!(error = %e, "Reclaim pass failed");
                self.metrics.record_processed(Status::Error);
            }
        }

        debug!("Reclaim task stopped");
    }

    /// One read-and-process cycle.
    pub async fn process_batch(&self) -> Result<BatchReport, BrokerError> {
        let batch = self
            .stream
            .read_group(
                &self.settings.stream_name,
                &self.settings.group,
                &self.settings.consumer,
                self.settings.batch_size,
                self.settings.read_block,
            )
            .await?;

        Ok(self
            .process_entries(batch.iter().map(|entry| (entry, None)), None)
            .await)
    }

    /// One reclaim cycle.
    pub async fn reclaim_once(&self) -> Result<BatchReport, BrokerError> {
        self.reclaim(None).await
    }

    async fn reclaim(&self, shutdown: Option<&ShutdownSignal>) -> Result<BatchReport, BrokerError> {
        let reclaimed = self
            .stream
            .reclaim_stale(
                &self.settings.stream_name,
                &self.settings.group,
                &self.settings.consumer,
                self.settings.visibility_timeout,
                self.settings.batch_size,
            )
            .await?;

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed stale entries");
        }
        for r in &reclaimed {
            debug!(id = %r.entry.id, delivery_count = r.delivery_count, "Redelivering");
        }

        Ok(self
            .process_entries(
                reclaimed.iter().map(|r| (&r.entry, Some(r.delivery_count))),
                shutdown,
            )
            .await)
    }

    async fn process_entries<'a>(
        &self,
        entries: impl Iterator<Item = (&'a StreamEntry, Option<u64>)>,
        shutdown: Option<&ShutdownSignal>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (entry, delivery_count) in entries {
            if shutdown.is_some_and(|s| s.is_shutdown()) {
                break;
            }
            report.record(&self.process_delivery(entry, delivery_count).await);
        }
        report
    }

    /// Decide what to do with one entry and carry it out.
    pub async fn process_entry(&self, entry: &StreamEntry) -> Outcome {
        self.process_delivery(entry, None).await
    }

    /// A redelivery past the retry limit is dead-lettered without being
    /// decoded or handed to the sink.
    async fn process_delivery(&self, entry: &StreamEntry, delivery_count: Option<u64>) -> Outcome {
        if let Some(count) = delivery_count.filter(|c| *c > self.settings.retry_limit) {
            warn!(
                id = %entry.id,
                delivery_count = count,
                retry_limit = self.settings.retry_limit,
                "Redelivered past retry limit"
            );
            return self
                .dead_letter(entry, DeadLetterReason::RetryLimitExceeded)
                .await;
        }

        match self.decide(entry).await {
            Disposition::Ack(classification) => self.ack(entry, classification).await,
            Disposition::DeadLetter(reason) => self.dead_letter(entry, reason).await,
            Disposition::Retry => Outcome::Deferred,
            Disposition::Failed => Outcome::Failed,
        }
    }

    async fn decide(&self, entry: &StreamEntry) -> Disposition {
        let Some(payload) = entry.payload() else {
            warn!(id = %entry.id, "Entry has no data field");
            return Disposition::DeadLetter(DeadLetterReason::MalformedPayload);
        };

        let event = match TelemetryEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(id = %entry.id, error = %e, "Malformed payload");
                return Disposition::DeadLetter(DeadLetterReason::MalformedPayload);
            }
        };

        let classification = self.detector.classify(&event);
        if classification == Classification::Invalid {
            warn!(
                id = %entry.id,
                device_id = %event.device_id(),
                reading = event.reading(),
                "Reading above physical ceiling"
            );
            return Disposition::DeadLetter(DeadLetterReason::PhysicalImpossibility);
        }

        match self.sink.deliver(&event, classification).await {
            Ok(()) => Disposition::Ack(classification),
            Err(SinkError::Rejected(msg)) => {
                warn!(id = %entry.id, sink = %self.sink.name(), reason = %msg, "Sink rejected event");
                Disposition::DeadLetter(DeadLetterReason::ProcessingFault(msg))
            }
            Err(SinkError::Transient(msg)) => self.retry_or_give_up(entry, &msg).await,
        }
    }

    async fn retry_or_give_up(&self, entry: &StreamEntry, fault: &str) -> Disposition {
        let delivery_count = match self
            .stream
            .delivery_count(&self.settings.stream_name, &self.settings.group, entry.id)
            .await
        {
            Ok(Some(count)) => count,
            Ok(None) => {
                debug!(id = %entry.id, "Entry no longer pending");
                return Disposition::Failed;
            }
            Err(e) => {
                error!(id = %entry.id, error = %e, "Could not read delivery count");
                return Disposition::Failed;
            }
        };

        if delivery_count > self.settings.retry_limit {
            warn!(
                id = %entry.id,
                delivery_count,
                retry_limit = self.settings.retry_limit,
                error = %fault,
                "Retry limit exceeded"
            );
            Disposition::DeadLetter(DeadLetterReason::RetryLimitExceeded)
        } else {
            warn!(
                id = %entry.id,
                delivery_count,
                retry_limit = self.settings.retry_limit,
                error = %fault,
                "Transient fault, leaving entry for redelivery"
            );
            Disposition::Retry
        }
    }

    async fn ack(&self, entry: &StreamEntry, classification: Classification) -> Outcome {
        match self
            .stream
            .ack(&self.settings.stream_name, &self.settings.group, entry.id)
            .await
        {
            Ok(true) => {
                self.metrics.record_processed(Status::Success);
                if classification == Classification::Anomalous {
                    self.metrics.record_anomaly();
                }
                debug!(id = %entry.id, classification = classification.as_str(), "Acked");
                Outcome::Acked
            }
            Ok(false) => {
                debug!(id = %entry.id, "Already acknowledged elsewhere");
                Outcome::Acked
            }
            Err(e) => {
                error!(id = %entry.id, error = %e, "Failed to ack entry");
                Outcome::Failed
            }
        }
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: DeadLetterReason) -> Outcome {
        let payload = entry.payload().unwrap_or_default();
        match self.dlq.shunt(entry.id, payload, &reason).await {
            Ok(_) => {
                self.metrics.record_processed(Status::Error);
                self.metrics.record_dead_letter(reason.kind());
                Outcome::DeadLettered(reason)
            }
            // shunt has already logged; the entry stays pending
            Err(_) => Outcome::Failed,
        }
    }
}
