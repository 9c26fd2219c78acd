use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration as ChronoDuration, Timelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use anima_core::config::ArchiveConfig;

use crate::error::{EventStoreError, Result};
use crate::event::Event;
use crate::sqlite::SqliteEventStore;
use crate::store::EventStore;

/// Stream receiving archival lifecycle events.
const ARCHIVAL_STREAM: &str = "system_archival";

/// Backoff after a failed archival run.
const ERROR_BACKOFF: Duration = Duration::from_secs(3600);

/// Outcome of one archival pass.
#[derive(Debug, Clone, Default)]
pub struct ArchiveReport {
    pub marked: u64,
    pub archived: u64,
    pub deleted: u64,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// gzip + base64 an event payload for the archive table.
pub fn compress_payload(payload: &Value, level: u32) -> Result<String> {
    let raw = serde_json::to_vec(payload)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish())
        .map(|bytes| BASE64.encode(bytes))
        .map_err(|e| EventStoreError::Archive(format!("gzip failed: {e}")))
}

/// Inverse of [`compress_payload`].
pub fn decompress_payload(data: &str) -> Result<Value> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| EventStoreError::Archive(format!("base64 decode failed: {e}")))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| EventStoreError::Archive(format!("gunzip failed: {e}")))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Moves cold events into the compressed archive partition.
///
/// The pass is two-phase and idempotent on retry: marking is a flag flip,
/// copying upserts by original event id, and deletion only touches rows
/// already present in the archive whose correlation group has no unarchived
/// sibling left.
pub struct Archiver {
    store: Arc<SqliteEventStore>,
    config: ArchiveConfig,
}

impl Archiver {
    pub fn new(store: Arc<SqliteEventStore>, config: ArchiveConfig) -> Self {
        Self { store, config }
    }

    /// One full mark → copy → delete pass. Dry-run counts candidates only.
    pub async fn run_once(&self) -> Result<ArchiveReport> {
        let started = std::time::Instant::now();
        let cutoff = (Utc::now() - ChronoDuration::days(self.config.days_threshold)).to_rfc3339();
        let mut report = ArchiveReport {
            dry_run: self.config.dry_run,
            ..Default::default()
        };

        if self.config.dry_run {
            report.marked = self.store.with_conn(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE timestamp < ?1 AND NOT archived",
                    params![cutoff],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })?;
            info!(candidates = report.marked, "archival dry run");
            return Ok(report);
        }

        // Phase 1: flip the archived flag on cold rows.
        report.marked = self.store.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE events SET archived = 1 WHERE timestamp < ?1 AND NOT archived",
                params![cutoff],
            )?;
            Ok(n as u64)
        })?;

        // Phase 2: copy marked rows into the archive in batches. Rows copied
        // by a previous interrupted run are skipped by the NOT EXISTS guard.
        loop {
            let batch: Vec<(String, String, String, String, String)> =
                self.store.with_conn(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT e.event_id, e.stream_id, e.event_type, e.data, e.timestamp
                         FROM events e
                         WHERE e.archived = 1
                           AND NOT EXISTS (
                               SELECT 1 FROM archived_events a
                               WHERE a.original_event_id = e.event_id)
                         LIMIT ?1",
                    )?;
                    let rows = stmt.query_map(params![self.config.batch_size], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    })?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?);
                    }
                    Ok(out)
                })?;
            if batch.is_empty() {
                break;
            }

            for (event_id, stream_id, event_type, data, timestamp) in batch {
                let payload: Value = serde_json::from_str(&data)?;
                let compressed = compress_payload(&payload, self.config.compression_level)?;
                let inserted = self.store.with_conn(|conn| {
                    let n = conn.execute(
                        "INSERT OR IGNORE INTO archived_events
                         (original_event_id, stream_id, event_type, compressed_data, original_timestamp)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![event_id, stream_id, event_type, compressed, timestamp],
                    )?;
                    Ok(n as u64)
                })?;
                report.archived += inserted;
            }
        }

        // Phase 3: delete originals, but only when the whole correlation
        // group has left the hot partition.
        report.deleted = self.store.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM events
                 WHERE archived = 1
                   AND event_id IN (SELECT original_event_id FROM archived_events)
                   AND (correlation_id IS NULL OR NOT EXISTS (
                        SELECT 1 FROM events s
                        WHERE s.correlation_id = events.correlation_id
                          AND NOT s.archived))",
                [],
            )?;
            Ok(n as u64)
        })?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            marked = report.marked,
            archived = report.archived,
            deleted = report.deleted,
            duration_ms = report.duration_ms,
            "archival pass complete"
        );

        self.emit_completed(&report).await;
        Ok(report)
    }

    async fn emit_completed(&self, report: &ArchiveReport) {
        let store: Arc<dyn EventStore> = self.store.clone();
        let version = match store.get_last_event(ARCHIVAL_STREAM).await {
            Ok(Some(last)) => last.version() + 1,
            _ => 0,
        };
        let event = Event::new(
            ARCHIVAL_STREAM,
            "ArchivalCompletedEvent",
            json!({
                "marked": report.marked,
                "archived": report.archived,
                "deleted": report.deleted,
                "dry_run": report.dry_run,
                "duration_ms": report.duration_ms,
            }),
        )
        .with_version(version);
        if let Err(e) = store.append(event).await {
            warn!(error = %e, "failed to record ArchivalCompletedEvent");
        }
    }

    /// Run daily at the configured wall-clock time. Errors back off one
    /// hour, then the pass is retried. The returned handle is aborted by the
    /// owner on shutdown.
    pub fn spawn_daily(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(until_next_run(
                    self.config.schedule_hour,
                    self.config.schedule_minute,
                ))
                .await;
                loop {
                    match self.run_once().await {
                        Ok(_) => break,
                        Err(e) => {
                            error!(error = %e, "archival failed, backing off one hour");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        })
    }
}

/// Duration until the next occurrence of `hh:mm` UTC.
fn until_next_run(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let mut next = now
        .with_hour(hour.min(23))
        .and_then(|t| t.with_minute(minute.min(59)))
        .and_then(|t| t.with_second(0))
        .unwrap_or(now);
    if next <= now {
        next += ChronoDuration::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}
