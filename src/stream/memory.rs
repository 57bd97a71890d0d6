//! Process-local stream with Redis-like consumer-group semantics.
//!
//! Used by the test suites and for running the pipeline without a broker.
//! Outages can be simulated with [`InMemoryStream::set_unavailable`] and
//! [`InMemoryStream::fail_appends_to`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BrokerError, EntryId, ReclaimedEntry, Stream, StreamEntry};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u64,
    last_delivered_at: Instant,
}

#[derive(Debug)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<StreamEntry>,
    last_id: Option<EntryId>,
    groups: HashMap<String, Group>,
}

impl Log {
    fn next_id(&self) -> EntryId {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        match self.last_id {
            Some(last) if now_ms <= last.ms => EntryId::new(last.ms, last.seq + 1),
            _ => EntryId::new(now_ms, 0),
        }
    }
}

/// In-memory [`Stream`] implementation.
#[derive(Default)]
pub struct InMemoryStream {
    logs: Mutex<HashMap<String, Log>>,
    appended: Notify,
    unavailable: AtomicBool,
    failing_appends: Mutex<HashSet<String>>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make appends to `stream` fail until [`restore_appends_to`](Self::restore_appends_to).
    pub fn fail_appends_to(&self, stream: &str) {
        lock(&self.failing_appends).insert(stream.to_string());
    }

    pub fn restore_appends_to(&self, stream: &str) {
        lock(&self.failing_appends).remove(stream);
    }

    /// Ids currently pending for `group`, in order.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<EntryId> {
        lock(&self.logs)
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Consumer currently owning a pending entry.
    pub fn pending_owner(&self, stream: &str, group: &str, id: EntryId) -> Option<String> {
        lock(&self.logs)
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.consumer.clone())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("in-memory broker unavailable".to_string()));
        }
        Ok(())
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut logs = lock(&self.logs);
        let no_group = || BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let log = logs.get_mut(stream).ok_or_else(no_group)?;
        let Log {
            entries, groups, ..
        } = log;
        let state = groups.get_mut(group).ok_or_else(no_group)?;

        let start = entries.partition_point(|e| e.id <= state.last_delivered);
        let batch: Vec<StreamEntry> = entries[start..].iter().take(count).cloned().collect();

        let now = Instant::now();
        for entry in &batch {
            state.last_delivered = entry.id;
            state.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivered_at: now,
                },
            );
        }

        Ok(batch)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Stream for InMemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        lock(&self.logs)
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Group {
                last_delivered: EntryId::ZERO,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<EntryId, BrokerError> {
        self.check_available()?;
        if lock(&self.failing_appends).contains(stream) {
            return Err(BrokerError::Command(format!("append to '{}' rejected", stream)));
        }

        let id = {
            let mut logs = lock(&self.logs);
            let log = logs.entry(stream.to_string()).or_default();
            let id = log.next_id();
            log.entries.push(StreamEntry {
                id,
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
            });
            log.last_id = Some(id);
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = Instant::now() + block;

        loop {
            self.check_available()?;

            // Register interest before looking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.deliver_new(stream, group, consumer, count)?;
            if !batch.is_empty() || block.is_zero() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        self.check_available()?;
        let removed = lock(&self.logs)
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .is_some();
        Ok(removed)
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        visibility_timeout: Duration,
        count: usize,
    ) -> Result<Vec<ReclaimedEntry>, BrokerError> {
        self.check_available()?;
        let mut logs = lock(&self.logs);
        let no_group = || BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let log = logs.get_mut(stream).ok_or_else(no_group)?;
        let state = log.groups.get_mut(group).ok_or_else(no_group)?;

        let now = Instant::now();
        let stale: Vec<EntryId> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_delivered_at) >= visibility_timeout)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let entry = match log.entries.binary_search_by(|e| e.id.cmp(&id)) {
                Ok(idx) => log.entries[idx].clone(),
                Err(_) => {
                    // Trimmed from the log; nothing left to deliver.
                    state.pending.remove(&id);
                    continue;
                }
            };
            if let Some(pending) = state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivery_count += 1;
                pending.last_delivered_at = now;
                reclaimed.push(ReclaimedEntry {
                    entry,
                    delivery_count: pending.delivery_count,
                });
            }
        }

        Ok(reclaimed)
    }

    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> Result<Option<u64>, BrokerError> {
        self.check_available()?;
        Ok(lock(&self.logs)
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| p.delivery_count))
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        self.check_available()?;
        Ok(lock(&self.logs)
            .get(stream)
            .map(|log| log.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError> {
        self.check_available()?;
        Ok(lock(&self.logs)
            .get(stream)
            .map(|log| log.entries.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const STREAM: &str = "telemetry_stream";
    const GROUP: &str = "workers";

    async fn stream_with_group() -> InMemoryStream {
        let stream = InMemoryStream::new();
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        stream
    }

    async fn append(stream: &InMemoryStream, body: &str) -> EntryId {
        stream
            .append(STREAM, &[("data", body.as_bytes())])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let stream = InMemoryStream::new();
        let mut last = EntryId::ZERO;
        for i in 0..200 {
            let id = append(&stream, &i.to_string()).await;
            assert!(id > last);
            last = id;
        }
        assert_eq!(stream.len(STREAM).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_read_group_delivers_in_order_once() {
        let stream = stream_with_group().await;
        let a = append(&stream, "a").await;
        let b = append(&stream, "b").await;
        let c = append(&stream, "c").await;

        let first = stream
            .read_group(STREAM, GROUP, "w1", 2, Duration::ZERO)
            .await
            .unwrap();
        let ids: Vec<_> = first.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);

        // another consumer in the same group only sees what is left
        let second = stream
            .read_group(STREAM, GROUP, "w2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, c);
        assert_eq!(second[0].payload(), Some(&b"c"[..]));

        assert_eq!(stream.pending_ids(STREAM, GROUP), vec![a, b, c]);
        assert_eq!(stream.pending_owner(STREAM, GROUP, c).as_deref(), Some("w2"));
        assert_eq!(stream.delivery_count(STREAM, GROUP, a).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_group_sees_entries_appended_before_creation() {
        let stream = InMemoryStream::new();
        let early = append(&stream, "early").await;
        stream.ensure_group(STREAM, GROUP).await.unwrap();
        // idempotent
        stream.ensure_group(STREAM, GROUP).await.unwrap();

        let batch = stream
            .read_group(STREAM, GROUP, "w1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].id, early);
    }

    #[tokio::test]
    async fn test_read_group_unknown_group() {
        let stream = InMemoryStream::new();
        let err = stream
            .read_group(STREAM, "missing", "w1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_read_group_times_out_empty() {
        let stream = stream_with_group().await;
        let batch = stream
            .read_group(STREAM, GROUP, "w1", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_read_group_wakes_on_append() {
        let stream = Arc::new(stream_with_group().await);

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read_group(STREAM, GROUP, "w1", 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = append(&stream, "late").await;

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
    }

    #[tokio::test]
    async fn test_double_ack_is_noop() {
        let stream = stream_with_group().await;
        let id = append(&stream, "x").await;
        stream
            .read_group(STREAM, GROUP, "w1", 10, Duration::ZERO)
            .await
            .unwrap();

        assert!(stream.ack(STREAM, GROUP, id).await.unwrap());
        assert!(!stream.ack(STREAM, GROUP, id).await.unwrap());
        assert!(stream.pending_ids(STREAM, GROUP).is_empty());
        assert_eq!(stream.delivery_count(STREAM, GROUP, id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reclaim_increments_delivery_count_once_per_cycle() {
        let stream = stream_with_group().await;
        let id = append(&stream, "x").await;
        stream
            .read_group(STREAM, GROUP, "w1", 10, Duration::ZERO)
            .await
            .unwrap();

        let first = stream
            .reclaim_stale(STREAM, GROUP, "w2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].entry.id, id);
        assert_eq!(first[0].delivery_count, 2);
        assert_eq!(stream.pending_owner(STREAM, GROUP, id).as_deref(), Some("w2"));

        let second = stream
            .reclaim_stale(STREAM, GROUP, "w3", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(second[0].delivery_count, 3);
    }

    #[tokio::test]
    async fn test_reclaim_respects_visibility_timeout() {
        let stream = stream_with_group().await;
        let id = append(&stream, "x").await;
        stream
            .read_group(STREAM, GROUP, "w1", 10, Duration::ZERO)
            .await
            .unwrap();

        let none = stream
            .reclaim_stale(STREAM, GROUP, "w2", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        // acked entries are never reclaimed
        stream.ack(STREAM, GROUP, id).await.unwrap();
        let none = stream
            .reclaim_stale(STREAM, GROUP, "w2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let stream = stream_with_group().await;
        stream.set_unavailable(true);
        assert!(matches!(
            stream.ping().await,
            Err(BrokerError::Connection(_))
        ));
        assert!(stream.append(STREAM, &[("data", b"x")]).await.is_err());

        stream.set_unavailable(false);
        assert!(stream.ping().await.is_ok());

        stream.fail_appends_to("dlq");
        assert!(stream.append("dlq", &[("data", b"x")]).await.is_err());
        assert!(stream.append(STREAM, &[("data", b"x")]).await.is_ok());
        stream.restore_appends_to("dlq");
        assert!(stream.append("dlq", &[("data", b"x")]).await.is_ok());
    }
}
