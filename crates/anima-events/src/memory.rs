use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{EventStoreError, Result};
use crate::event::Event;
use crate::store::{EventStore, StoreMetrics};

/// In-memory event store.
///
/// Appends to one stream are serialized through a per-stream lock map; the
/// shared structures (streams, timestamp index, LRU cache) sit behind one
/// short-lived mutex. When `total_events` exceeds the configured cap, whole
/// streams are evicted oldest-first (by their most recent event) and the
/// timestamp index is rebuilt.
pub struct MemoryEventStore {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    inner: Mutex<Inner>,
    max_events: usize,
    cache_capacity: usize,
    total_appends: AtomicU64,
    total_reads: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    version_conflicts: AtomicU64,
    total_cleanups: AtomicU64,
}

struct Inner {
    streams: HashMap<String, Vec<Event>>,
    /// Sorted by (timestamp, stream_id, position) for binary-searched scans.
    index: Vec<(DateTime<Utc>, String, usize)>,
    cache: LruCache<String, Vec<Event>>,
    total_events: usize,
}

impl MemoryEventStore {
    pub fn new(max_events: usize, cache_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            locks: DashMap::new(),
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                index: Vec::new(),
                cache: LruCache::new(cap),
                total_events: 0,
            }),
            max_events,
            cache_capacity,
            total_appends: AtomicU64::new(0),
            total_reads: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            total_cleanups: AtomicU64::new(0),
        }
    }

    fn stream_lock(&self, stream_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Evict whole streams oldest-first until under the cap, then rebuild
    /// the timestamp index and drop the cache.
    fn cleanup_old_events(&self, inner: &mut Inner) {
        let excess = inner.total_events.saturating_sub(self.max_events);
        if excess == 0 {
            return;
        }
        warn!(excess, "event store over capacity, evicting oldest streams");

        let mut stream_info: Vec<(DateTime<Utc>, String, usize)> = inner
            .streams
            .iter()
            .filter_map(|(id, events)| {
                events
                    .last()
                    .map(|e| (e.timestamp(), id.clone(), events.len()))
            })
            .collect();
        stream_info.sort();

        let mut removed = 0usize;
        let mut victims = Vec::new();
        for (_, stream_id, len) in stream_info {
            if removed >= excess {
                break;
            }
            removed += len;
            victims.push(stream_id);
        }

        for stream_id in &victims {
            inner.streams.remove(stream_id);
            self.locks.remove(stream_id);
        }

        inner.index.clear();
        inner.total_events = 0;
        for (stream_id, events) in &inner.streams {
            for (pos, event) in events.iter().enumerate() {
                inner
                    .index
                    .push((event.timestamp(), stream_id.clone(), pos));
                inner.total_events += 1;
            }
        }
        inner.index.sort_by(|a, b| (a.0, &a.1, a.2).cmp(&(b.0, &b.1, b.2)));
        inner.cache = LruCache::new(NonZeroUsize::new(self.cache_capacity.max(1)).unwrap());

        self.total_cleanups.fetch_add(1, Ordering::Relaxed);
        info!(
            streams_removed = victims.len(),
            events_removed = removed,
            remaining = inner.total_events,
            "event store eviction complete"
        );
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> Result<()> {
        let lock = self.stream_lock(event.stream_id());
        let _guard = lock.lock().await;

        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .streams
            .get(event.stream_id())
            .map(|s| s.len() as u32)
            .unwrap_or(0);
        if event.version() != current {
            self.version_conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(EventStoreError::VersionConflict {
                stream_id: event.stream_id().to_string(),
                expected: event.version(),
                actual: current,
            });
        }

        let stream_id = event.stream_id().to_string();
        let timestamp = event.timestamp();
        let entry = inner.streams.entry(stream_id.clone()).or_default();
        let position = entry.len();
        debug!(
            stream_id = %stream_id,
            event_type = event.event_type(),
            version = event.version(),
            "event appended"
        );
        entry.push(event);

        let key = (timestamp, stream_id.clone(), position);
        let idx = inner
            .index
            .partition_point(|e| (e.0, &e.1, e.2) < (key.0, &key.1, key.2));
        inner.index.insert(idx, key);

        inner.cache.pop(&stream_id);
        inner.total_events += 1;
        self.total_appends.fetch_add(1, Ordering::Relaxed);

        if inner.total_events > self.max_events {
            self.cleanup_old_events(&mut inner);
        }
        Ok(())
    }

    async fn get_stream(&self, stream_id: &str, from_version: u32) -> Result<Vec<Event>> {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();

        if from_version == 0 {
            if let Some(cached) = inner.cache.get(stream_id) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.clone());
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let events: Vec<Event> = inner
            .streams
            .get(stream_id)
            .map(|s| s.iter().skip(from_version as usize).cloned().collect())
            .unwrap_or_default();

        if from_version == 0 && !events.is_empty() {
            inner.cache.put(stream_id.to_string(), events.clone());
        }
        Ok(events)
    }

    async fn get_events_after(
        &self,
        timestamp: DateTime<Utc>,
        event_types: Option<&[&str]>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        let start = inner.index.partition_point(|e| e.0 <= timestamp);

        let mut result = Vec::new();
        for (_, stream_id, position) in &inner.index[start..] {
            if let Some(event) = inner.streams.get(stream_id).and_then(|s| s.get(*position)) {
                match event_types {
                    Some(types) if !types.contains(&event.event_type()) => continue,
                    _ => result.push(event.clone()),
                }
            }
        }
        Ok(result)
    }

    async fn get_last_event(&self, stream_id: &str) -> Result<Option<Event>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(stream_id)
            .and_then(|s| s.last())
            .cloned())
    }

    async fn stream_exists(&self, stream_id: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.streams.contains_key(stream_id))
    }

    fn metrics(&self) -> StoreMetrics {
        let inner = self.inner.lock().unwrap();
        StoreMetrics {
            total_events: inner.total_events as u64,
            total_appends: self.total_appends.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            total_cleanups: self.total_cleanups.load(Ordering::Relaxed),
            batch_writes: 0,
            buffer_overflows: 0,
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryEventStore {
        MemoryEventStore::new(10_000, 16)
    }

    #[tokio::test]
    async fn versions_are_gap_free() {
        let store = store();
        for v in 0..5 {
            let event = Event::new("user_u1", "SessionUpdatedEvent", json!({"n": v}))
                .with_version(v);
            store.append(event).await.unwrap();
        }
        let stream = store.get_stream("user_u1", 0).await.unwrap();
        let versions: Vec<u32> = stream.iter().map(|e| e.version()).collect();
        assert_eq!(versions, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn conflict_is_counted_and_recoverable() {
        let store = store();
        store
            .append(Event::new("user_u1", "A", json!({})).with_version(0))
            .await
            .unwrap();

        let err = store
            .append(Event::new("user_u1", "B", json!({})).with_version(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EventStoreError::VersionConflict { actual: 1, .. }));
        assert_eq!(store.metrics().version_conflicts, 1);

        // Retry with the refreshed version succeeds.
        store
            .append(Event::new("user_u1", "B", json!({})).with_version(1))
            .await
            .unwrap();
        assert_eq!(store.metrics().version_conflicts, 1);
    }

    #[tokio::test]
    async fn new_stream_must_start_at_zero() {
        let store = store();
        let err = store
            .append(Event::new("user_u2", "A", json!({})).with_version(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::VersionConflict {
                expected: 3,
                actual: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn append_read_round_trip() {
        let store = store();
        let event = Event::new("ltm_u1", "NoveltyCalculatedEvent", json!({"score": 0.9}))
            .with_version(0)
            .with_correlation("req-1");
        store.append(event.clone()).await.unwrap();

        let read = store.get_last_event("ltm_u1").await.unwrap().unwrap();
        assert_eq!(read, event);
        assert!(store.stream_exists("ltm_u1").await.unwrap());
        assert!(!store.stream_exists("ltm_u2").await.unwrap());
    }

    #[tokio::test]
    async fn timestamp_scan_filters_types() {
        let store = store();
        let before = Utc::now() - chrono::Duration::seconds(10);
        store
            .append(Event::new("s1", "TypeA", json!({})).with_version(0))
            .await
            .unwrap();
        store
            .append(Event::new("s2", "TypeB", json!({})).with_version(0))
            .await
            .unwrap();

        let all = store.get_events_after(before, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_a = store
            .get_events_after(before, Some(&["TypeA"]))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].event_type(), "TypeA");
        // Ascending timestamp order.
        assert!(all[0].timestamp() <= all[1].timestamp());
    }

    #[tokio::test]
    async fn cache_hit_after_full_read() {
        let store = store();
        store
            .append(Event::new("s1", "A", json!({})).with_version(0))
            .await
            .unwrap();
        store.get_stream("s1", 0).await.unwrap();
        store.get_stream("s1", 0).await.unwrap();
        let metrics = store.metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[tokio::test]
    async fn eviction_removes_oldest_streams_whole() {
        let store = MemoryEventStore::new(4, 8);
        for v in 0..3 {
            store
                .append(Event::new("old", "A", json!({})).with_version(v))
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        for v in 0..2 {
            store
                .append(Event::new("fresh", "A", json!({})).with_version(v))
                .await
                .unwrap();
        }
        // 5 > 4 triggered eviction of the whole "old" stream.
        assert!(!store.stream_exists("old").await.unwrap());
        assert!(store.stream_exists("fresh").await.unwrap());
        assert_eq!(store.metrics().total_cleanups, 1);
        // Evicted stream restarts at version 0.
        store
            .append(Event::new("old", "A", json!({})).with_version(0))
            .await
            .unwrap();
    }
}
