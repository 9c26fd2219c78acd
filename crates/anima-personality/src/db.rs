use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::error::Result;
use crate::resonance::ResonanceProfile;
use crate::traits::BaseTrait;

/// Initialise the personality tables and seed the base trait rows.
/// Idempotent: existing rows win over the built-in defaults.
pub fn init_db(conn: &Connection, defaults: &[BaseTrait]) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS personality_base_traits (
            trait_name TEXT PRIMARY KEY,
            base_value REAL NOT NULL,
            is_core    INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS user_personality_resonance (
            user_id           TEXT PRIMARY KEY,
            coefficients      TEXT NOT NULL,
            interaction_count INTEGER NOT NULL DEFAULT 0,
            last_adaptation   TEXT,
            last_interaction  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS resonance_adaptation_history (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            modifier_type TEXT NOT NULL,
            modifier_data TEXT NOT NULL,
            applied_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_adaptation_history_user
            ON resonance_adaptation_history(user_id, applied_at DESC);",
    )?;
    for base in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO personality_base_traits (trait_name, base_value, is_core)
             VALUES (?1, ?2, ?3)",
            params![base.name, base.base_value, base.is_core],
        )?;
    }
    Ok(())
}

/// Persistence for resonance profiles and the modifier history, behind the
/// personality actor.
pub struct PersonalityDb {
    db: Mutex<Connection>,
}

impl PersonalityDb {
    pub fn new(conn: Connection, defaults: &[BaseTrait]) -> Result<Self> {
        init_db(&conn, defaults)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn load_resonance(&self, user_id: &str) -> Result<Option<ResonanceProfile>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT user_id, coefficients, interaction_count, last_adaptation, last_interaction
                 FROM user_personality_resonance
                 WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((user_id, coefficients, interaction_count, last_adaptation, last_interaction)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(ResonanceProfile {
            user_id,
            coefficients: serde_json::from_str(&coefficients)?,
            interaction_count: interaction_count as u64,
            last_adaptation: last_adaptation
                .as_deref()
                .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&chrono::Utc)),
            last_interaction: chrono::DateTime::parse_from_rfc3339(&last_interaction)
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now()),
        }))
    }

    pub fn save_resonance(&self, profile: &ResonanceProfile) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO user_personality_resonance
             (user_id, coefficients, interaction_count, last_adaptation, last_interaction)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                coefficients      = excluded.coefficients,
                interaction_count = excluded.interaction_count,
                last_adaptation   = excluded.last_adaptation,
                last_interaction  = excluded.last_interaction",
            params![
                profile.user_id,
                serde_json::to_string(&profile.coefficients)?,
                profile.interaction_count as i64,
                profile.last_adaptation.map(|t| t.to_rfc3339()),
                profile.last_interaction.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn all_resonance_user_ids(&self) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT user_id FROM user_personality_resonance")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn record_modifier(
        &self,
        user_id: &str,
        modifier_type: &str,
        modifier_data: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO resonance_adaptation_history
             (user_id, modifier_type, modifier_data, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                modifier_type,
                modifier_data.to_string(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Base traits as stored (seeded from the defaults on first start).
    pub fn base_traits(&self) -> Result<Vec<(String, f64, bool)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT trait_name, base_value, is_core FROM personality_base_traits",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get::<_, bool>(2)?))
        })?;
        let mut traits = Vec::new();
        for row in rows {
            traits.push(row?);
        }
        Ok(traits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::base_traits;

    #[test]
    fn resonance_round_trip() {
        let defaults = base_traits();
        let db = PersonalityDb::new(Connection::open_in_memory().unwrap(), &defaults).unwrap();
        let mut profile = ResonanceProfile::new("u1", &defaults);
        profile.coefficients.insert("irony".into(), 1.25);
        profile.interaction_count = 7;
        db.save_resonance(&profile).unwrap();

        let loaded = db.load_resonance("u1").unwrap().unwrap();
        assert_eq!(loaded.interaction_count, 7);
        assert!((loaded.coefficients["irony"] - 1.25).abs() < 1e-9);
        assert!(db.load_resonance("u2").unwrap().is_none());
        assert_eq!(db.all_resonance_user_ids().unwrap(), vec!["u1"]);
    }

    #[test]
    fn base_traits_are_seeded_once() {
        let defaults = base_traits();
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn, &defaults).unwrap();
        // Simulate an operator tweak; re-init must not clobber it.
        conn.execute(
            "UPDATE personality_base_traits SET base_value = 0.99 WHERE trait_name = 'irony'",
            [],
        )
        .unwrap();
        let db = PersonalityDb::new(conn, &defaults).unwrap();
        let traits = db.base_traits().unwrap();
        let irony = traits.iter().find(|(name, _, _)| name == "irony").unwrap();
        assert!((irony.1 - 0.99).abs() < 1e-9);
    }
}
