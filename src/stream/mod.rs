//! Append-only log with consumer-group delivery tracking.
//!
//! The [`Stream`] trait models the durable log the pipeline relies on. Two
//! implementations ship with the crate:
//!
//! - [`RedisStream`]: Redis Streams through a `deadpool-redis` pool
//! - [`InMemoryStream`]: a process-local log with the same delivery contract
//!
//! # Delivery contract
//!
//! ```text
//!  append ──► [1-0][2-0][3-0][4-0] ...        total order per stream
//!                        ▲
//!                        └─ group cursor (last delivered id)
//!
//!  read_group ──► new entries past the cursor, added to `pending`
//!  ack        ──► removes from `pending` (no-op if absent)
//!  reclaim    ──► pending entries idle >= visibility timeout are handed
//!                 to the caller with delivery_count + 1
//! ```

mod memory;
mod redis;

pub use self::memory::InMemoryStream;
pub use self::redis::RedisStream;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::event::DATA_FIELD;

/// Broker-side failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("unexpected broker reply: {0}")]
    Protocol(String),
}

/// Identifier of a stream entry, `<milliseconds>-<sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::Protocol(format!("invalid entry id '{}'", s));
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// A delivered stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Vec<(String, Vec<u8>)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    /// The serialized event in the `data` field, if present.
    pub fn payload(&self) -> Option<&[u8]> {
        self.field(DATA_FIELD)
    }
}

/// An entry taken over from a stalled consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedEntry {
    pub entry: StreamEntry,
    pub delivery_count: u64,
}

/// Durable, ordered log with consumer groups.
///
/// Implementations must be safe to share between producers, workers and the
/// reclaim task (`Arc<dyn Stream>`).
#[async_trait]
pub trait Stream: Send + Sync {
    /// Create `group` on `stream`, starting from the first entry, if it does
    /// not exist yet. Creates the stream too.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Append an entry and return its id.
    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<EntryId, BrokerError>;

    /// Deliver up to `count` entries the group has not seen yet, waiting up to
    /// `block` for new ones. Returns an empty batch on timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledge an entry. Returns `false` if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError>;

    /// Take over entries pending for at least `visibility_timeout`.
    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        visibility_timeout: Duration,
        count: usize,
    ) -> Result<Vec<ReclaimedEntry>, BrokerError>;

    /// Number of times a pending entry has been delivered.
    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> Result<Option<u64>, BrokerError>;

    /// Number of entries in the stream.
    async fn len(&self, stream: &str) -> Result<u64, BrokerError>;

    /// The first `count` entries of the stream.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Check that a stream or group name is usable as a broker key.
pub fn validate_key(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }
    if name.len() > 256 {
        let head: String = name.chars().take(32).collect();
        return Err(format!("'{}...' is longer than 256 bytes", head));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("'{}' contains whitespace or control characters", name));
    }
    Ok(())
}
