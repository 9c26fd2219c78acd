use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use anima_core::config::EventStoreConfig;

use crate::error::{EventStoreError, Result};
use crate::event::Event;
use crate::store::{EventStore, StoreMetrics};

/// Schema generation this build writes and expects. A mismatch at startup is
/// the only fatal error class in the store.
pub const SCHEMA_VERSION: i64 = 1;

/// Row cap for timestamp scans.
const SCAN_LIMIT: usize = 1000;

/// Durable SQLite-backed event store.
///
/// Appends are buffered and flushed in per-stream transactions when the
/// buffer reaches `batch_size` or on the periodic flush interval. Each
/// stream's batch is written with its own version check; on conflict or I/O
/// failure the batch is pushed back to the front of the buffer in order.
/// The single guarded connection serializes concurrent appends to a stream.
#[derive(Debug)]
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    buffer: Mutex<VecDeque<Event>>,
    batch_size: usize,
    max_buffer_size: usize,
    closed: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    total_appends: AtomicU64,
    total_reads: AtomicU64,
    version_conflicts: AtomicU64,
    batch_writes: AtomicU64,
    buffer_overflows: AtomicU64,
}

impl SqliteEventStore {
    /// Open (or create) the database at `config.db_path` and verify the
    /// schema version.
    pub fn open(config: &EventStoreConfig) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&config.db_path)?;
        Self::with_connection(conn, config)
    }

    /// Wrap an already-open connection (tests use `open_in_memory`).
    pub fn with_connection(conn: Connection, config: &EventStoreConfig) -> Result<Self> {
        init_schema(&conn)?;
        verify_schema_version(&conn)?;
        info!(db = %config.db_path, "sqlite event store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            buffer: Mutex::new(VecDeque::new()),
            batch_size: config.batch_size,
            max_buffer_size: config.max_buffer_size,
            closed: AtomicBool::new(false),
            flush_task: Mutex::new(None),
            total_appends: AtomicU64::new(0),
            total_reads: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            batch_writes: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
        })
    }

    /// Start the periodic flush loop. Idempotent; the previous task is
    /// replaced.
    pub fn start_periodic_flush(store: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(store);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                if store.closed.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = store.flush() {
                    error!(error = %e, "periodic event flush failed");
                }
            }
        });
        let mut slot = store.flush_task.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Write everything currently buffered, grouped by stream. Failed
    /// groups go back to the front of the buffer in their original order.
    pub fn flush(&self) -> Result<()> {
        let drained: Vec<Event> = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        // Group by stream preserving first-seen order.
        let mut groups: Vec<(String, Vec<Event>)> = Vec::new();
        for event in drained {
            match groups.iter_mut().find(|(id, _)| id == event.stream_id()) {
                Some((_, bucket)) => bucket.push(event),
                None => groups.push((event.stream_id().to_string(), vec![event])),
            }
        }

        let mut failed: Vec<Event> = Vec::new();
        let mut conn = self.conn.lock().unwrap();
        for (stream_id, events) in groups {
            match write_stream_events(&mut conn, &stream_id, &events) {
                Ok(()) => {
                    self.batch_writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    if matches!(e, EventStoreError::VersionConflict { .. }) {
                        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!(stream_id = %stream_id, error = %e, "stream batch write failed, requeueing");
                    failed.extend(events);
                }
            }
        }
        drop(conn);

        if !failed.is_empty() {
            let mut buffer = self.buffer.lock().unwrap();
            for event in failed.into_iter().rev() {
                buffer.push_front(event);
            }
        }
        Ok(())
    }

    /// Next expected version for a stream: persisted tail plus anything
    /// still sitting in the write buffer.
    fn next_version(&self, stream_id: &str) -> Result<u32> {
        let buffered = {
            let buffer = self.buffer.lock().unwrap();
            buffer.iter().filter(|e| e.stream_id() == stream_id).count() as u32
        };
        let conn = self.conn.lock().unwrap();
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM events WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(last.map(|v| v as u32 + 1).unwrap_or(0) + buffered)
    }

    /// Per-table row counts for storage monitoring.
    pub fn table_sizes(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap();
        let mut sizes = Vec::new();
        for table in ["events", "archived_events"] {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
            sizes.push((table.to_string(), count as u64));
        }
        Ok(sizes)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EventStoreError::Closed);
        }

        let expected = self.next_version(event.stream_id())?;
        if event.version() != expected {
            self.version_conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(EventStoreError::VersionConflict {
                stream_id: event.stream_id().to_string(),
                expected: event.version(),
                actual: expected,
            });
        }

        let len = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_back(event);
            buffer.len()
        };
        self.total_appends.fetch_add(1, Ordering::Relaxed);

        if len >= self.max_buffer_size {
            self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
            warn!(len, "event buffer hard cap reached, forcing flush");
            self.flush()?;
        } else if len >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    async fn get_stream(&self, stream_id: &str, from_version: u32) -> Result<Vec<Event>> {
        self.flush()?;
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, stream_id, event_type, data, timestamp, version, correlation_id
             FROM events
             WHERE stream_id = ?1 AND version >= ?2 AND NOT archived
             ORDER BY version",
        )?;
        let rows = stmt.query_map(params![stream_id, from_version], row_to_event)?;
        collect_events(rows)
    }

    async fn get_events_after(
        &self,
        timestamp: DateTime<Utc>,
        event_types: Option<&[&str]>,
    ) -> Result<Vec<Event>> {
        self.flush()?;
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        let ts = timestamp.to_rfc3339();
        let conn = self.conn.lock().unwrap();

        match event_types {
            Some(types) => {
                // Build a placeholder list for the IN clause.
                let placeholders = types
                    .iter()
                    .enumerate()
                    .map(|(i, _)| format!("?{}", i + 2))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT event_id, stream_id, event_type, data, timestamp, version, correlation_id
                     FROM events
                     WHERE timestamp > ?1 AND event_type IN ({placeholders}) AND NOT archived
                     ORDER BY timestamp
                     LIMIT {SCAN_LIMIT}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut values: Vec<&dyn rusqlite::ToSql> = vec![&ts];
                for t in types {
                    values.push(t);
                }
                let rows = stmt.query_map(values.as_slice(), row_to_event)?;
                collect_events(rows)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT event_id, stream_id, event_type, data, timestamp, version, correlation_id
                     FROM events
                     WHERE timestamp > ?1 AND NOT archived
                     ORDER BY timestamp
                     LIMIT {SCAN_LIMIT}"
                ))?;
                let rows = stmt.query_map(params![ts], row_to_event)?;
                collect_events(rows)
            }
        }
    }

    async fn get_last_event(&self, stream_id: &str) -> Result<Option<Event>> {
        self.flush()?;
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                "SELECT event_id, stream_id, event_type, data, timestamp, version, correlation_id
                 FROM events
                 WHERE stream_id = ?1 AND NOT archived
                 ORDER BY version DESC
                 LIMIT 1",
                params![stream_id],
                row_to_event,
            )
            .optional()?;
        event.map(finish_event).transpose()
    }

    async fn stream_exists(&self, stream_id: &str) -> Result<bool> {
        self.flush()?;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn metrics(&self) -> StoreMetrics {
        let total: u64 = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))
            .map(|v| v as u64)
            .unwrap_or(0);
        StoreMetrics {
            total_events: total,
            total_appends: self.total_appends.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            cache_hits: 0,
            cache_misses: 0,
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            total_cleanups: 0,
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        self.flush()?;
        debug!("sqlite event store closed");
        Ok(())
    }
}

/// Write one stream's events in a single transaction with a version check.
fn write_stream_events(
    conn: &mut Connection,
    stream_id: &str,
    events: &[Event],
) -> Result<()> {
    let tx = conn.transaction()?;
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(version) FROM events WHERE stream_id = ?1",
        params![stream_id],
        |row| row.get(0),
    )?;
    let mut expected = last.map(|v| v as u32 + 1).unwrap_or(0);

    for event in events {
        if event.version() != expected {
            return Err(EventStoreError::VersionConflict {
                stream_id: stream_id.to_string(),
                expected: event.version(),
                actual: expected,
            });
        }
        tx.execute(
            "INSERT INTO events
             (event_id, stream_id, event_type, data, timestamp, version, correlation_id, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                event.event_id(),
                event.stream_id(),
                event.event_type(),
                serde_json::to_string(event.payload())?,
                event.timestamp().to_rfc3339(),
                event.version(),
                event.correlation_id(),
            ],
        )?;
        expected += 1;
    }
    tx.commit()?;
    Ok(())
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            event_id       TEXT PRIMARY KEY,
            stream_id      TEXT NOT NULL,
            event_type     TEXT NOT NULL,
            data           TEXT NOT NULL,
            timestamp      TEXT NOT NULL,
            version        INTEGER NOT NULL,
            correlation_id TEXT,
            archived       INTEGER NOT NULL DEFAULT 0,
            UNIQUE(stream_id, version)
        );
        CREATE INDEX IF NOT EXISTS idx_events_stream_timestamp
            ON events(stream_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_type_timestamp
            ON events(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp_active
            ON events(timestamp) WHERE NOT archived;

        CREATE TABLE IF NOT EXISTS archived_events (
            original_event_id  TEXT PRIMARY KEY,
            stream_id          TEXT NOT NULL,
            event_type         TEXT NOT NULL,
            compressed_data    TEXT NOT NULL,
            original_timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event_store_metadata (
            id             INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL
        );",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO event_store_metadata (id, schema_version) VALUES (1, ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn verify_schema_version(conn: &Connection) -> Result<()> {
    let found: i64 = conn.query_row(
        "SELECT schema_version FROM event_store_metadata WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    if found != SCHEMA_VERSION {
        return Err(EventStoreError::SchemaVersionMismatch {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(())
}

type RawEvent = (
    String,
    String,
    String,
    String,
    String,
    u32,
    Option<String>,
);

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i64>(5)? as u32,
        row.get(6)?,
    ))
}

fn finish_event(raw: RawEvent) -> Result<Event> {
    let (event_id, stream_id, event_type, data, timestamp, version, correlation_id) = raw;
    let payload = serde_json::from_str(&data)?;
    let ts = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| EventStoreError::Archive(format!("bad timestamp in row: {e}")))?
        .with_timezone(&Utc);
    Ok(Event::from_parts(
        event_id,
        stream_id,
        event_type,
        payload,
        ts,
        version,
        correlation_id,
    ))
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawEvent>>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for row in rows {
        events.push(finish_event(row?)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteEventStore {
        let conn = Connection::open_in_memory().unwrap();
        let config = EventStoreConfig {
            batch_size: 3,
            max_buffer_size: 10,
            ..Default::default()
        };
        SqliteEventStore::with_connection(conn, &config).unwrap()
    }

    #[tokio::test]
    async fn buffered_append_flushes_at_batch_size() {
        let store = store();
        for v in 0..2 {
            store
                .append(Event::new("s1", "A", json!({"v": v})).with_version(v))
                .await
                .unwrap();
        }
        assert_eq!(store.metrics().batch_writes, 0);
        store
            .append(Event::new("s1", "A", json!({"v": 2})).with_version(2))
            .await
            .unwrap();
        assert_eq!(store.metrics().batch_writes, 1);
        assert_eq!(store.metrics().total_events, 3);
    }

    #[tokio::test]
    async fn version_conflict_counts_buffered_events() {
        let store = store();
        store
            .append(Event::new("s1", "A", json!({})).with_version(0))
            .await
            .unwrap();
        // One event is buffered, so the next expected version is 1.
        let err = store
            .append(Event::new("s1", "A", json!({})).with_version(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::VersionConflict { actual: 1, .. }));
        assert_eq!(store.metrics().version_conflicts, 1);
    }

    #[tokio::test]
    async fn reads_reflect_prior_appends() {
        let store = store();
        store
            .append(Event::new("s1", "A", json!({"k": "v"})).with_version(0))
            .await
            .unwrap();
        // Still buffered (batch size 3), but reads flush first.
        let stream = store.get_stream("s1", 0).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].payload()["k"], "v");
        assert!(store.stream_exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn round_trip_preserves_all_fields() {
        let store = store();
        let event = Event::new("s1", "MemoryStoredEvent", json!({"user_id": "u1", "n": 7}))
            .with_version(0)
            .with_correlation("corr-1");
        store.append(event.clone()).await.unwrap();
        let read = store.get_last_event("s1").await.unwrap().unwrap();
        assert_eq!(read.event_type(), event.event_type());
        assert_eq!(read.payload(), event.payload());
        assert_eq!(read.version(), event.version());
        assert_eq!(read.correlation_id(), event.correlation_id());
        assert_eq!(
            read.timestamp().timestamp_millis(),
            event.timestamp().timestamp_millis()
        );
    }

    #[tokio::test]
    async fn timestamp_scan_is_capped_and_filtered() {
        let store = store();
        let before = Utc::now() - chrono::Duration::seconds(5);
        for v in 0..4 {
            store
                .append(Event::new("s1", if v % 2 == 0 { "A" } else { "B" }, json!({}))
                    .with_version(v))
                .await
                .unwrap();
        }
        let only_a = store
            .get_events_after(before, Some(&["A"]))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|e| e.event_type() == "A"));
    }

    #[tokio::test]
    async fn close_drains_buffer_and_rejects_appends() {
        let store = store();
        store
            .append(Event::new("s1", "A", json!({})).with_version(0))
            .await
            .unwrap();
        store.close().await.unwrap();
        assert_eq!(store.metrics().total_events, 1);
        let err = store
            .append(Event::new("s1", "A", json!({})).with_version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Closed));
    }

    #[test]
    fn schema_version_mismatch_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute("UPDATE event_store_metadata SET schema_version = 99", [])
            .unwrap();
        let err = SqliteEventStore::with_connection(conn, &EventStoreConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::SchemaVersionMismatch { found: 99, .. }
        ));
    }
}
