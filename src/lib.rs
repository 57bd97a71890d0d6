//! # Telemetry Pipeline
//!
//! Ingests sensor telemetry over HTTP, buffers it in a durable stream, and
//! processes it with a group of competing workers. Entries that can never be
//! processed end up on a dead-letter stream with a reason tag.
//!
//! ## Architecture
//!
//! ```text
//! Device -> POST /ingest -> Validator -> main stream
//!                                          │ consumer group
//!                                          ▼
//!                        Worker -> AnomalyDetector -> Sink -> ack
//!                          │
//!                          └── undeliverable ──► dead-letter stream
//! ```
//!
//! ## Modules
//!
//! - [`validate`]: schema and allow-list checks for inbound events
//! - [`producer`]: validated append to the main stream
//! - [`stream`]: broker abstraction with Redis and in-memory backends
//! - [`worker`]: consumer-group state machine, retries and reclaim
//! - [`anomaly`]: threshold classification of readings
//! - [`dlq`]: dead-letter routing
//! - [`sink`]: downstream actions for classified events
//! - [`http`]: axum routes for ingest, health and metrics

pub mod anomaly;
pub mod config;
pub mod dlq;
pub mod event;
pub mod http;
pub mod metrics;
pub mod producer;
pub mod shutdown;
pub mod sink;
pub mod stream;
pub mod validate;
pub mod worker;

// Re-export commonly used types at crate root
pub use anomaly::{AnomalyDetector, Classification};
pub use config::PipelineConfig;
pub use dlq::{DeadLetterReason, DeadLetterRouter};
pub use event::TelemetryEvent;
pub use producer::{IngestError, Producer};
pub use stream::{BrokerError, EntryId, InMemoryStream, RedisStream, Stream, StreamEntry};
pub use validate::{ValidationError, Validator};
pub use worker::{BatchReport, Worker, WorkerError, WorkerSettings};
