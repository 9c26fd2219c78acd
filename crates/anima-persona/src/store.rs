use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use anima_core::types::{GenerationMode, StyleVector};

use crate::detector::TraitManifestation;
use crate::error::Result;

/// Active persona row for one user. At most one row per user is active.
#[derive(Debug, Clone)]
pub struct PartnerPersona {
    pub persona_id: String,
    pub user_id: String,
    pub version: i64,
    pub style_vector: StyleVector,
    pub style_confidence: f64,
    pub recommended_mode: Option<GenerationMode>,
    pub mode_confidence: f64,
    pub messages_analyzed: i64,
}

/// Owner of `partner_personas` and the trait manifestations table.
pub struct PersonaStore {
    db: Mutex<Connection>,
}

impl PersonaStore {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn active_persona(&self, user_id: &str) -> Result<Option<PartnerPersona>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT persona_id, user_id, version, style_vector, style_confidence,
                        recommended_mode, mode_confidence, messages_analyzed
                 FROM partner_personas
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY updated_at DESC
                 LIMIT 1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            persona_id,
            user_id,
            version,
            style_vector,
            style_confidence,
            recommended_mode,
            mode_confidence,
            messages_analyzed,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(PartnerPersona {
            persona_id,
            user_id,
            version,
            style_vector: serde_json::from_str(&style_vector)?,
            style_confidence,
            recommended_mode: recommended_mode.and_then(|m| m.parse().ok()),
            mode_confidence,
            messages_analyzed,
        }))
    }

    /// Write a new active version, atomically deactivating the prior one.
    /// Returns the new persona id and version.
    pub fn update_persona(
        &self,
        user_id: &str,
        style_vector: &StyleVector,
        style_confidence: f64,
        recommended_mode: GenerationMode,
        mode_confidence: f64,
        messages_analyzed: i64,
    ) -> Result<(String, i64)> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let last_version: Option<i64> = tx.query_row(
            "SELECT MAX(version) FROM partner_personas WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let version = last_version.unwrap_or(0) + 1;

        tx.execute(
            "UPDATE partner_personas SET is_active = 0 WHERE user_id = ?1 AND is_active = 1",
            params![user_id],
        )?;

        let persona_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO partner_personas
             (persona_id, user_id, version, style_vector, style_confidence,
              recommended_mode, mode_confidence, messages_analyzed, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            params![
                persona_id,
                user_id,
                version,
                serde_json::to_string(style_vector)?,
                style_confidence,
                recommended_mode.as_str(),
                mode_confidence,
                messages_analyzed,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(user_id, version, mode = recommended_mode.as_str(), "partner persona updated");
        Ok((persona_id, version))
    }

    /// Persist detected traits under one shared batch id.
    pub fn save_manifestations(
        &self,
        user_id: &str,
        mode: Option<GenerationMode>,
        traits: &[TraitManifestation],
    ) -> Result<String> {
        let batch_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        for manifestation in traits {
            tx.execute(
                "INSERT INTO personality_traits_manifestations
                 (user_id, trait_name, manifestation_strength, mode, emotional_context,
                  detected_markers, confidence, analysis_batch_id, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    user_id,
                    manifestation.trait_name,
                    manifestation.strength,
                    mode.map(|m| m.as_str()),
                    serde_json::to_string(&manifestation.emotional_context)?,
                    serde_json::to_string(&manifestation.markers)?,
                    manifestation.strength,
                    batch_id,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(batch_id)
    }

    pub fn active_count(&self, user_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM partner_personas WHERE user_id = ?1 AND is_active = 1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PersonaStore {
        PersonaStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn vector(p: f64, s: f64, e: f64, c: f64) -> StyleVector {
        StyleVector {
            playfulness: p,
            seriousness: s,
            emotionality: e,
            creativity: c,
        }
    }

    #[test]
    fn version_increments_and_old_row_deactivates() {
        let personas = store();
        let (_, v1) = personas
            .update_persona("u1", &vector(0.3, 0.7, 0.5, 0.5), 0.6, GenerationMode::Expert, 0.7, 20)
            .unwrap();
        assert_eq!(v1, 1);
        let (_, v2) = personas
            .update_persona("u1", &vector(0.8, 0.2, 0.5, 0.5), 0.6, GenerationMode::Talk, 0.8, 40)
            .unwrap();
        assert_eq!(v2, 2);

        // At most one active row per user.
        assert_eq!(personas.active_count("u1").unwrap(), 1);
        let active = personas.active_persona("u1").unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.recommended_mode, Some(GenerationMode::Talk));
    }

    #[test]
    fn missing_persona_is_none() {
        let personas = store();
        assert!(personas.active_persona("nobody").unwrap().is_none());
    }

    #[test]
    fn manifestations_share_a_batch_id() {
        let personas = store();
        let traits = vec![
            TraitManifestation {
                trait_name: "empathy".into(),
                strength: 0.7,
                markers: vec!["i understand".into()],
                emotional_context: Default::default(),
            },
            TraitManifestation {
                trait_name: "irony".into(),
                strength: 0.5,
                markers: vec!["oh sure".into()],
                emotional_context: Default::default(),
            },
        ];
        let batch = personas
            .save_manifestations("u1", Some(GenerationMode::Talk), &traits)
            .unwrap();

        let db = personas.db.lock().unwrap();
        let count: i64 = db
            .query_row(
                "SELECT COUNT(*) FROM personality_traits_manifestations
                 WHERE user_id = 'u1' AND analysis_batch_id = ?1",
                params![batch],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
