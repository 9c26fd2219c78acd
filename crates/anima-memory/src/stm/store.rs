use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{info, warn};

use anima_core::config::StmConfig;

use crate::error::{MemoryError, Result};

/// Which side of the conversation a buffer row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerRole {
    User,
    Bot,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerRole::User => "user",
            SpeakerRole::Bot => "bot",
        }
    }

    /// LLM chat role for the structured context format.
    pub fn llm_role(&self) -> &'static str {
        match self {
            SpeakerRole::User => "user",
            SpeakerRole::Bot => "assistant",
        }
    }
}

impl fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SpeakerRole {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(SpeakerRole::User),
            "bot" => Ok(SpeakerRole::Bot),
            other => Err(MemoryError::InvalidPayload(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFormat {
    /// `{role, content}` pairs ready for the LLM.
    Structured,
    /// Raw `{type, content, timestamp}` triples for debugging.
    Text,
}

impl ContextFormat {
    pub fn parse(s: &str) -> Self {
        match s {
            "text" => ContextFormat::Text,
            _ => ContextFormat::Structured,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextFormat::Structured => "structured",
            ContextFormat::Text => "text",
        }
    }
}

/// Formatted dialogue context handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct MemoryContext {
    pub user_id: String,
    pub messages: Vec<Value>,
    pub total_messages: usize,
    pub format: ContextFormat,
}

impl MemoryContext {
    pub fn empty(user_id: &str, format: ContextFormat) -> Self {
        Self {
            user_id: user_id.to_string(),
            messages: Vec::new(),
            total_messages: 0,
            format,
        }
    }
}

/// Per-user ring buffer over SQLite.
///
/// Every insert enforces the buffer cap by deleting the oldest rows by
/// `sequence_number`; long content is truncated with a metadata note.
pub struct StmStore {
    db: Mutex<Connection>,
    buffer_size: usize,
    max_length: usize,
}

impl StmStore {
    pub fn new(conn: Connection, config: &StmConfig) -> Result<Self> {
        super::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            buffer_size: config.buffer_size,
            max_length: config.message_max_length,
        })
    }

    /// Insert one turn into the ring buffer, evicting the oldest rows when
    /// the user's count exceeds the cap.
    pub fn store(
        &self,
        user_id: &str,
        role: SpeakerRole,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let mut metadata = match metadata {
            Some(Value::Object(map)) => Value::Object(map),
            Some(Value::Null) | None => json!({}),
            Some(other) => json!({ "value": other }),
        };

        let stored: String = if content.chars().count() > self.max_length {
            let truncated: String = content.chars().take(self.max_length).collect();
            metadata["truncated"] = json!(true);
            metadata["original_length"] = json!(content.chars().count());
            warn!(
                user_id,
                original = content.chars().count(),
                max = self.max_length,
                "truncated message for STM"
            );
            truncated
        } else {
            content.to_string()
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO stm_buffer (user_id, message_type, content, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                role.as_str(),
                stored,
                metadata.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;

        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM stm_buffer WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        if count as usize > self.buffer_size {
            let excess = count as usize - self.buffer_size;
            let deleted = db.execute(
                "DELETE FROM stm_buffer WHERE sequence_number IN (
                    SELECT sequence_number FROM stm_buffer
                    WHERE user_id = ?1
                    ORDER BY sequence_number ASC
                    LIMIT ?2)",
                params![user_id, excess as i64],
            )?;
            if deleted > 0 {
                info!(user_id, deleted, "evicted oldest STM rows");
            }
        }
        Ok(())
    }

    /// Dialogue context in chronological order. Rows are fetched newest
    /// first then reversed, so the caller always sees oldest → newest.
    pub fn context(
        &self,
        user_id: &str,
        limit: Option<usize>,
        format: ContextFormat,
    ) -> Result<MemoryContext> {
        let limit = limit.unwrap_or(self.buffer_size);
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT message_type, content, metadata, timestamp
             FROM stm_buffer
             WHERE user_id = ?1
             ORDER BY sequence_number DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut newest_first: Vec<(String, String, String, String)> = Vec::new();
        for row in rows {
            newest_first.push(row?);
        }

        let mut messages = Vec::with_capacity(newest_first.len());
        for (message_type, content, _metadata, timestamp) in newest_first.into_iter().rev() {
            let entry = match format {
                ContextFormat::Structured => {
                    let role = SpeakerRole::from_str(&message_type)
                        .map(|r| r.llm_role())
                        .unwrap_or("user");
                    json!({ "role": role, "content": content })
                }
                ContextFormat::Text => json!({
                    "type": message_type,
                    "content": content,
                    "timestamp": timestamp,
                }),
            };
            messages.push(entry);
        }

        let total = messages.len();
        Ok(MemoryContext {
            user_id: user_id.to_string(),
            messages,
            total_messages: total,
            format,
        })
    }

    pub fn clear(&self, user_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let deleted = db.execute(
            "DELETE FROM stm_buffer WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(deleted)
    }

    pub fn count(&self, user_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM stm_buffer WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
