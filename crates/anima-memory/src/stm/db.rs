use rusqlite::{Connection, Result};

/// Initialise the STM ring buffer table. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stm_buffer (
            sequence_number INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id         TEXT NOT NULL,
            message_type    TEXT NOT NULL,
            content         TEXT NOT NULL,
            metadata        TEXT NOT NULL DEFAULT '{}',
            timestamp       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stm_user_sequence
            ON stm_buffer(user_id, sequence_number DESC);
        CREATE INDEX IF NOT EXISTS idx_stm_user_timestamp
            ON stm_buffer(user_id, timestamp);",
    )
}
