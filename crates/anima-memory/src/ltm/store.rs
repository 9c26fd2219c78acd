use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

use anima_core::emotion::{cosine_similarity, EmotionVector};

use crate::error::{MemoryError, Result};
use crate::ltm::types::{LtmMemory, MemoryType, TriggerReason, UserProfile};

/// Owner of `ltm_memories` and `ltm_user_profiles`.
pub struct LtmStore {
    db: Mutex<Connection>,
}

impl LtmStore {
    pub fn new(conn: Connection) -> Result<Self> {
        super::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn save_memory(&self, memory: &LtmMemory) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO ltm_memories
             (memory_id, user_id, user_text, bot_text, emotional_snapshot,
              dominant_emotions, importance_score, novelty_score, memory_type,
              trigger_reason, semantic_tags, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                memory.memory_id,
                memory.user_id,
                memory.user_text,
                memory.bot_text,
                serde_json::to_string(&memory.emotional_snapshot)?,
                serde_json::to_string(&memory.dominant_emotions)?,
                memory.importance_score,
                memory.novelty_score,
                memory.memory_type.as_str(),
                memory.trigger_reason.as_str(),
                serde_json::to_string(&memory.semantic_tags)?,
                memory
                    .embedding
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                memory.created_at.to_rfc3339(),
            ],
        )?;
        debug!(user_id = %memory.user_id, memory_id = %memory.memory_id, "LTM memory saved");
        Ok(())
    }

    pub fn delete_memory(&self, memory_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let deleted = db.execute(
            "DELETE FROM ltm_memories WHERE memory_id = ?1",
            params![memory_id],
        )?;
        if deleted == 0 {
            return Err(MemoryError::NotFound {
                memory_id: memory_id.to_string(),
            });
        }
        Ok(())
    }

    /// Newest memories first.
    pub fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<LtmMemory>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT memory_id, user_id, user_text, bot_text, emotional_snapshot,
                    dominant_emotions, importance_score, novelty_score, memory_type,
                    trigger_reason, semantic_tags, embedding, created_at
             FROM ltm_memories
             WHERE user_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_memory)?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(finish_memory(row?)?);
        }
        Ok(memories)
    }

    /// Cosine-similarity search over stored embeddings, best match first.
    /// Rows without an embedding are skipped.
    pub fn search_vector(
        &self,
        user_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<LtmMemory>> {
        // Scan the user's rows; per-user memory counts are small by design
        // (the save gate targets 2-5% of turns).
        let candidates = self.recent(user_id, usize::MAX / 2)?;
        let mut scored: Vec<(f64, LtmMemory)> = candidates
            .into_iter()
            .filter_map(|memory| {
                memory
                    .embedding
                    .as_deref()
                    .map(|e| (cosine_similarity(query, e), memory.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
    }

    pub fn count_memories(&self, user_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM ltm_memories WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn load_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT user_id, total_messages, emotion_frequencies, tag_frequencies,
                        recent_novelty_scores, emotion_mean, embedding_centroid,
                        current_percentile_90, calibration_complete, created_at
                 FROM ltm_user_profiles
                 WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, bool>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            user_id,
            total_messages,
            emotion_frequencies,
            tag_frequencies,
            recent_novelty_scores,
            emotion_mean,
            embedding_centroid,
            current_percentile_90,
            calibration_complete,
            created_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(UserProfile {
            user_id,
            total_messages: total_messages as u64,
            emotion_frequencies: serde_json::from_str(&emotion_frequencies)?,
            tag_frequencies: serde_json::from_str(&tag_frequencies)?,
            recent_novelty_scores: serde_json::from_str(&recent_novelty_scores)?,
            emotion_mean: serde_json::from_str::<EmotionVector>(&emotion_mean)
                .unwrap_or_else(|_| EmotionVector::zeros()),
            embedding_centroid: embedding_centroid
                .map(|c| serde_json::from_str(&c))
                .transpose()?,
            current_percentile_90,
            calibration_complete,
            created_at: parse_timestamp(&created_at)?,
        }))
    }

    pub fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO ltm_user_profiles
             (user_id, total_messages, emotion_frequencies, tag_frequencies,
              recent_novelty_scores, emotion_mean, embedding_centroid,
              current_percentile_90, calibration_complete, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id) DO UPDATE SET
                total_messages        = excluded.total_messages,
                emotion_frequencies   = excluded.emotion_frequencies,
                tag_frequencies       = excluded.tag_frequencies,
                recent_novelty_scores = excluded.recent_novelty_scores,
                emotion_mean          = excluded.emotion_mean,
                embedding_centroid    = excluded.embedding_centroid,
                current_percentile_90 = excluded.current_percentile_90,
                calibration_complete  = excluded.calibration_complete",
            params![
                profile.user_id,
                profile.total_messages as i64,
                serde_json::to_string(&profile.emotion_frequencies)?,
                serde_json::to_string(&profile.tag_frequencies)?,
                serde_json::to_string(&profile.recent_novelty_scores)?,
                serde_json::to_string(&profile.emotion_mean)?,
                profile
                    .embedding_centroid
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                profile.current_percentile_90,
                profile.calibration_complete,
                profile.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

type RawMemory = (
    String,
    String,
    String,
    String,
    String,
    String,
    f64,
    f64,
    String,
    String,
    String,
    Option<String>,
    String,
);

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMemory> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn finish_memory(raw: RawMemory) -> Result<LtmMemory> {
    let (
        memory_id,
        user_id,
        user_text,
        bot_text,
        emotional_snapshot,
        dominant_emotions,
        importance_score,
        novelty_score,
        memory_type,
        trigger_reason,
        semantic_tags,
        embedding,
        created_at,
    ) = raw;
    Ok(LtmMemory {
        memory_id,
        user_id,
        user_text,
        bot_text,
        emotional_snapshot: serde_json::from_str(&emotional_snapshot)?,
        dominant_emotions: serde_json::from_str(&dominant_emotions)?,
        importance_score,
        novelty_score,
        memory_type: MemoryType::from_str(&memory_type)
            .map_err(MemoryError::InvalidPayload)?,
        trigger_reason: TriggerReason::from_str(&trigger_reason)
            .map_err(MemoryError::InvalidPayload)?,
        semantic_tags: serde_json::from_str(&semantic_tags)?,
        embedding: embedding.map(|e| serde_json::from_str(&e)).transpose()?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MemoryError::InvalidPayload(format!("bad timestamp: {e}")))
}
