//! Append-only event store with per-stream optimistic versioning.
//!
//! Two backends share one trait: an in-memory store with an LRU stream
//! cache and whole-stream eviction, and a durable SQLite store with batched
//! writes and scheduled gzip archival. Version conflicts are recoverable:
//! callers append through [`EventWriter`], which refreshes the version and
//! retries once.

pub mod archive;
pub mod error;
pub mod event;
pub mod memory;
pub mod monitor;
pub mod sqlite;
pub mod store;
pub mod version;

pub use archive::{ArchiveReport, Archiver};
pub use error::{EventStoreError, Result};
pub use event::Event;
pub use memory::MemoryEventStore;
pub use monitor::{StorageAlert, StorageMonitor, StorageThresholds};
pub use sqlite::SqliteEventStore;
pub use store::{build_store, EventStore, StoreMetrics};
pub use version::EventWriter;
