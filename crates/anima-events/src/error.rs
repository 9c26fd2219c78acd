use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Concurrent append to the same stream. Recoverable: re-read the last
    /// version and retry.
    #[error("Version conflict for stream {stream_id}: expected {expected}, got {actual}")]
    VersionConflict {
        stream_id: String,
        expected: u32,
        actual: u32,
    },

    /// Startup-only fatal: the on-disk schema does not match this build.
    #[error("Event store schema version mismatch: found {found}, expected {expected}")]
    SchemaVersionMismatch { found: i64, expected: i64 },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Event store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EventStoreError>;
