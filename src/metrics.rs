//! Pipeline counters.
//!
//! Every update goes to two places: an atomic counter on [`Metrics`], which
//! tests and shutdown logs read through [`Metrics::snapshot`], and the
//! `metrics` facade, which the Prometheus exporter renders for scraping.
//! Nothing in the pipeline reads these values to make decisions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const INGESTED: &str = "ingestion_requests_total";
pub const INGEST_LATENCY: &str = "ingestion_latency_seconds";
pub const PROCESSED: &str = "worker_processed_total";
pub const ANOMALIES: &str = "worker_anomalies_total";
pub const DEAD_LETTERED: &str = "worker_dead_lettered_total";

const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Outcome label shared by the ingest and processed counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ingested_success: u64,
    pub ingested_error: u64,
    pub processed_success: u64,
    pub processed_error: u64,
    pub anomalies_detected: u64,
    pub dead_lettered: u64,
    pub ingest_latency_samples: u64,
}

/// Process-wide metrics sink.
#[derive(Debug)]
pub struct Metrics {
    ingested_success: AtomicU64,
    ingested_error: AtomicU64,
    processed_success: AtomicU64,
    processed_error: AtomicU64,
    anomalies_detected: AtomicU64,
    dead_lettered: AtomicU64,
    ingest_latency_samples: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ingested_success: AtomicU64::new(0),
            ingested_error: AtomicU64::new(0),
            processed_success: AtomicU64::new(0),
            processed_error: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            ingest_latency_samples: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record one `ingest` call and how long it took.
    pub fn record_ingest(&self, status: Status, elapsed: Duration) {
        match status {
            Status::Success => self.ingested_success.fetch_add(1, Ordering::Relaxed),
            Status::Error => self.ingested_error.fetch_add(1, Ordering::Relaxed),
        };
        self.ingest_latency_samples.fetch_add(1, Ordering::Relaxed);

        counter!(INGESTED, "status" => status.as_str()).increment(1);
        histogram!(INGEST_LATENCY).record(elapsed.as_secs_f64());
    }

    pub fn record_processed(&self, status: Status) {
        match status {
            Status::Success => self.processed_success.fetch_add(1, Ordering::Relaxed),
            Status::Error => self.processed_error.fetch_add(1, Ordering::Relaxed),
        };
        counter!(PROCESSED, "status" => status.as_str()).increment(1);
    }

    pub fn record_anomaly(&self) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        counter!(ANOMALIES).increment(1);
    }

    pub fn record_dead_letter(&self, reason: &'static str) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        counter!(DEAD_LETTERED, "reason" => reason).increment(1);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingested_success: self.ingested_success.load(Ordering::Relaxed),
            ingested_error: self.ingested_error.load(Ordering::Relaxed),
            processed_success: self.processed_success.load(Ordering::Relaxed),
            processed_error: self.processed_error.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            ingest_latency_samples: self.ingest_latency_samples.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn describe() {
    describe_counter!(INGESTED, "Total ingestion requests");
    describe_histogram!(INGEST_LATENCY, Unit::Seconds, "Time spent processing request");
    describe_counter!(PROCESSED, "Total packets processed by worker");
    describe_counter!(ANOMALIES, "Anomalies detected");
    describe_counter!(DEAD_LETTERED, "Entries moved to the dead-letter stream");
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        metrics_exporter_prometheus::Matcher::Full(INGEST_LATENCY.to_string()),
        LATENCY_BUCKETS,
    )
}

/// Install the global recorder and return a handle for rendering `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = builder()?.install_recorder()?;
    describe();
    Ok(handle)
}

/// Install the global recorder with its own scrape listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn install_listener(addr: SocketAddr) -> Result<(), BuildError> {
    builder()?.with_http_listener(addr).install()?;
    describe();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();

        metrics.record_ingest(Status::Success, Duration::from_millis(2));
        metrics.record_ingest(Status::Error, Duration::from_millis(1));
        metrics.record_processed(Status::Success);
        metrics.record_processed(Status::Success);
        metrics.record_processed(Status::Error);
        metrics.record_anomaly();
        metrics.record_dead_letter("MALFORMED_JSON");

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                ingested_success: 1,
                ingested_error: 1,
                processed_success: 2,
                processed_error: 1,
                anomalies_detected: 1,
                dead_lettered: 1,
                ingest_latency_samples: 2,
            }
        );
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(Status::Success.as_str(), "success");
        assert_eq!(Status::Error.as_str(), "error");
    }
}
