use rusqlite::{Connection, Result};

/// Initialise the partner persona tables. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS partner_personas (
            persona_id        TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            version           INTEGER NOT NULL,
            style_vector      TEXT NOT NULL,
            style_confidence  REAL NOT NULL DEFAULT 0,
            recommended_mode  TEXT,
            mode_confidence   REAL NOT NULL DEFAULT 0,
            messages_analyzed INTEGER NOT NULL DEFAULT 0,
            is_active         INTEGER NOT NULL DEFAULT 1,
            updated_at        TEXT NOT NULL,
            UNIQUE(user_id, version)
        );
        CREATE INDEX IF NOT EXISTS idx_personas_user_active
            ON partner_personas(user_id, is_active);
        CREATE INDEX IF NOT EXISTS idx_personas_user_version
            ON partner_personas(user_id, version DESC);

        CREATE TABLE IF NOT EXISTS personality_traits_manifestations (
            id                     INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                TEXT NOT NULL,
            trait_name             TEXT NOT NULL,
            manifestation_strength REAL NOT NULL,
            mode                   TEXT,
            emotional_context      TEXT NOT NULL DEFAULT '{}',
            detected_markers       TEXT NOT NULL DEFAULT '[]',
            confidence             REAL NOT NULL,
            analysis_batch_id      TEXT NOT NULL,
            detected_at            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_manifestations_user
            ON personality_traits_manifestations(user_id, detected_at DESC);",
    )
}
