use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use anima_core::types::GenerationMode;

/// Per-user in-memory session state owned by the orchestrator.
///
/// Bounded collections are truncated on assignment, never on read: pushing
/// past the cap drops the oldest entries immediately.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub username: Option<String>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,

    pub current_mode: GenerationMode,
    /// In `[0, 1]`.
    pub mode_confidence: f64,
    pub mode_history: Vec<GenerationMode>,
    pub last_mode_change: Option<DateTime<Utc>>,

    pub cache_metrics: Vec<f64>,

    pub last_emotion_vector: Option<BTreeMap<String, f64>>,
    pub last_dominant_emotions: Vec<String>,

    pub last_user_text: Option<String>,
    pub last_bot_response: Option<String>,
    pub last_bot_mode: Option<GenerationMode>,
    pub last_bot_confidence: Option<f64>,

    pub partner_persona_version: Option<i64>,
    /// User messages seen since the last personality-analysis run.
    pub messages_since_analysis: u32,
}

/// Cap on retained cache metric samples.
const CACHE_METRICS_MAX: usize = 50;

impl Session {
    pub fn new(user_id: &str, username: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            username,
            message_count: 0,
            created_at: now,
            last_activity: now,
            current_mode: GenerationMode::Talk,
            mode_confidence: 0.0,
            mode_history: Vec::new(),
            last_mode_change: None,
            cache_metrics: Vec::new(),
            last_emotion_vector: None,
            last_dominant_emotions: Vec::new(),
            last_user_text: None,
            last_bot_response: None,
            last_bot_mode: None,
            last_bot_confidence: None,
            partner_persona_version: None,
            messages_since_analysis: 0,
        }
    }

    /// Record a detected mode, truncating the history to `history_size`.
    pub fn push_mode(&mut self, mode: GenerationMode, confidence: f64, history_size: usize) {
        if mode != self.current_mode {
            self.last_mode_change = Some(Utc::now());
            self.current_mode = mode;
        }
        self.mode_confidence = confidence.clamp(0.0, 1.0);
        self.mode_history.push(mode);
        if self.mode_history.len() > history_size {
            let drop = self.mode_history.len() - history_size;
            self.mode_history.drain(..drop);
        }
    }

    pub fn push_cache_metric(&mut self, value: f64) {
        self.cache_metrics.push(value);
        if self.cache_metrics.len() > CACHE_METRICS_MAX {
            let drop = self.cache_metrics.len() - CACHE_METRICS_MAX;
            self.cache_metrics.drain(..drop);
        }
    }

    /// Last three detected modes agree?
    pub fn stable_mode_streak(&self) -> Option<GenerationMode> {
        if self.mode_history.len() < 3 {
            return None;
        }
        let tail = &self.mode_history[self.mode_history.len() - 3..];
        if tail.iter().all(|m| *m == tail[0]) {
            Some(tail[0])
        } else {
            None
        }
    }
}
