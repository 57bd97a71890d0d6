//! Redis Streams adapter.
//!
//! | Operation        | Command                                      |
//! |------------------|----------------------------------------------|
//! | `ensure_group`   | `XGROUP CREATE <s> <g> 0 MKSTREAM`           |
//! | `append`         | `XADD <s> * field value ...`                 |
//! | `read_group`     | `XREADGROUP GROUP <g> <c> COUNT n BLOCK ms`  |
//! | `ack`            | `XACK <s> <g> <id>`                          |
//! | `reclaim_stale`  | `XAUTOCLAIM` + `XPENDING` for counts         |
//!
//! `XAUTOCLAIM` scans the pending list from a cursor. The cursor returned by
//! one call is kept per stream and group and used by the next, so a long
//! pending list is walked across reclaim cycles instead of always from the top.
//! | `delivery_count` | `XPENDING <s> <g> <id> <id> 1`               |

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerError, EntryId, ReclaimedEntry, Stream, StreamEntry};

/// [`Stream`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStream {
    pool: Pool,
    reclaim_cursors: Arc<Mutex<HashMap<(String, String), EntryId>>>,
}

impl RedisStream {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            reclaim_cursors: Arc::default(),
        }
    }

    /// Build a connection pool for `url`. Does not connect yet.
    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    fn reclaim_cursor(&self, stream: &str, group: &str) -> EntryId {
        self.reclaim_cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(stream.to_string(), group.to_string()))
            .copied()
            .unwrap_or(EntryId::ZERO)
    }

    fn set_reclaim_cursor(&self, stream: &str, group: &str, cursor: EntryId) {
        self.reclaim_cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((stream.to_string(), group.to_string()), cursor);
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn pending_count(
        &self,
        conn: &mut Connection,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> Result<Option<u64>, BrokerError> {
        let id = id.to_string();
        let reply: RedisValue = cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(&id)
            .arg(&id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| redis_error(e, stream, group))?;

        // [[id, consumer, idle_ms, delivery_count]]
        let count = as_array(&reply)
            .and_then(|rows| rows.first())
            .and_then(as_array)
            .and_then(|row| row.get(3))
            .and_then(as_u64);
        Ok(count)
    }
}

#[async_trait]
impl Stream for RedisStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, consumer_group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, consumer_group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(redis_error(e, stream, group)),
        }
    }

    async fn append(&self, stream: &str, fields: &[(&str, &[u8])]) -> Result<EntryId, BrokerError> {
        let mut conn = self.conn().await?;

        let mut xadd = cmd("XADD");
        xadd.arg(stream).arg("*");
        for (key, value) in fields {
            xadd.arg(*key).arg(*value);
        }

        let id: String = xadd
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(e, stream, ""))?;
        id.parse()
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn().await?;

        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 waits forever, so a zero timeout means a plain read.
        if !block.is_zero() {
            opts = opts.block(block.as_millis().max(1) as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(|e| redis_error(e, stream, group))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for element in key.ids {
                let id: EntryId = element.id.parse()?;
                let fields = element
                    .map
                    .iter()
                    .filter_map(|(k, v)| as_bytes(v).map(|b| (k.clone(), b)))
                    .collect();
                entries.push(StreamEntry { id, fields });
            }
        }
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let acked: u64 = conn
            .xack(stream, group, &[id.to_string()])
            .await
            .map_err(|e| redis_error(e, stream, group))?;
        Ok(acked > 0)
    }

    async fn reclaim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        visibility_timeout: Duration,
        count: usize,
    ) -> Result<Vec<ReclaimedEntry>, BrokerError> {
        let mut conn = self.conn().await?;
        let start = self.reclaim_cursor(stream, group);

        // XAUTOCLAIM key group consumer min-idle-time start [COUNT count]
        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(visibility_timeout.as_millis() as u64)
            .arg(start.to_string())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(e, stream, group))?;

        let (next, claimed) = parse_autoclaim(&reply)?;
        if next != start {
            debug!(stream, group, cursor = %next, "Reclaim cursor advanced");
        }
        self.set_reclaim_cursor(stream, group, next);

        let mut reclaimed = Vec::with_capacity(claimed.len());
        for value in claimed {
            let Some(entry) = parse_entry(value)? else {
                continue;
            };
            let delivery_count = self
                .pending_count(&mut conn, stream, group, entry.id)
                .await?
                .unwrap_or(1);
            reclaimed.push(ReclaimedEntry {
                entry,
                delivery_count,
            });
        }

        Ok(reclaimed)
    }

    async fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: EntryId,
    ) -> Result<Option<u64>, BrokerError> {
        let mut conn = self.conn().await?;
        self.pending_count(&mut conn, stream, group, id).await
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(e, stream, ""))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: RedisValue = cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(e, stream, ""))?;

        let mut entries = Vec::new();
        for value in as_array(&reply).unwrap_or(&[]) {
            if let Some(entry) = parse_entry(value)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }
}

fn redis_error(e: RedisError, stream: &str, group: &str) -> BrokerError {
    if e.to_string().contains("NOGROUP") {
        return BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        return BrokerError::Connection(e.to_string());
    }
    BrokerError::Command(e.to_string())
}

fn as_array(value: &RedisValue) -> Option<&[RedisValue]> {
    match value {
        RedisValue::Array(items) => Some(items),
        _ => None,
    }
}

fn as_bytes(value: &RedisValue) -> Option<Vec<u8>> {
    match value {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        RedisValue::Int(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

fn as_u64(value: &RedisValue) -> Option<u64> {
    match value {
        RedisValue::Int(n) => u64::try_from(*n).ok(),
        other => as_bytes(other)
            .and_then(|b| String::from_utf8(b).ok())
            .and_then(|s| s.parse().ok()),
    }
}

/// Split an `XAUTOCLAIM` reply `[next_cursor, [entry, ...], ...]`. A cursor
/// of `0-0` means the scan wrapped around.
fn parse_autoclaim(reply: &RedisValue) -> Result<(EntryId, &[RedisValue]), BrokerError> {
    let malformed = || BrokerError::Protocol("malformed XAUTOCLAIM reply".to_string());

    let parts = as_array(reply).ok_or_else(malformed)?;
    let cursor = parts
        .first()
        .and_then(as_bytes)
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(malformed)?
        .parse()?;
    let claimed = parts.get(1).and_then(as_array).ok_or_else(malformed)?;

    Ok((cursor, claimed))
}

/// Parse `[id, [field, value, ...]]`. Entries deleted since delivery come
/// back as nil.
fn parse_entry(value: &RedisValue) -> Result<Option<StreamEntry>, BrokerError> {
    if matches!(value, RedisValue::Nil) {
        return Ok(None);
    }
    let malformed = || BrokerError::Protocol("malformed stream entry".to_string());

    let parts = as_array(value).ok_or_else(malformed)?;
    let id = parts
        .first()
        .and_then(as_bytes)
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(malformed)?
        .parse()?;

    let flat = match parts.get(1) {
        Some(RedisValue::Nil) | None => return Ok(None),
        Some(v) => as_array(v).ok_or_else(malformed)?,
    };

    let fields = flat
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => {
                let key = String::from_utf8(as_bytes(k)?).ok()?;
                Some((key, as_bytes(v)?))
            }
            _ => None,
        })
        .collect();

    Ok(Some(StreamEntry { id, fields }))
}
