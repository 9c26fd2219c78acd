use rusqlite::{Connection, Result};

/// Initialise the LTM tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ltm_memories (
            memory_id          TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL,
            user_text          TEXT NOT NULL,
            bot_text           TEXT NOT NULL,
            emotional_snapshot TEXT NOT NULL,
            dominant_emotions  TEXT NOT NULL DEFAULT '[]',
            importance_score   REAL NOT NULL,
            novelty_score      REAL NOT NULL,
            memory_type        TEXT NOT NULL,
            trigger_reason     TEXT NOT NULL,
            semantic_tags      TEXT NOT NULL DEFAULT '[]',
            embedding          TEXT,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ltm_user_created
            ON ltm_memories(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS ltm_user_profiles (
            user_id               TEXT PRIMARY KEY,
            total_messages        INTEGER NOT NULL DEFAULT 0,
            emotion_frequencies   TEXT NOT NULL DEFAULT '{}',
            tag_frequencies       TEXT NOT NULL DEFAULT '{}',
            recent_novelty_scores TEXT NOT NULL DEFAULT '[]',
            emotion_mean          TEXT NOT NULL DEFAULT '{}',
            embedding_centroid    TEXT,
            current_percentile_90 REAL NOT NULL DEFAULT 0,
            calibration_complete  INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT NOT NULL
        );",
    )
}
