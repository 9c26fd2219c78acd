use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use anima_core::emotion::EmotionVector;

/// Whose world a memory is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    SelfRelated,
    UserRelated,
    WorldRelated,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::SelfRelated => "self_related",
            MemoryType::UserRelated => "user_related",
            MemoryType::WorldRelated => "world_related",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self_related" => Ok(MemoryType::SelfRelated),
            "user_related" => Ok(MemoryType::UserRelated),
            "world_related" => Ok(MemoryType::WorldRelated),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// Why a turn was considered for long-term retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    EmotionalPeak,
    SelfReference,
    DeepInsight,
    PersonalRevelation,
    Shift,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::EmotionalPeak => "emotional_peak",
            TriggerReason::SelfReference => "self_reference",
            TriggerReason::DeepInsight => "deep_insight",
            TriggerReason::PersonalRevelation => "personal_revelation",
            TriggerReason::Shift => "shift",
        }
    }

    /// Contribution of the trigger class to the importance score.
    pub fn weight(&self) -> f64 {
        match self {
            TriggerReason::EmotionalPeak => 0.9,
            TriggerReason::PersonalRevelation => 0.85,
            TriggerReason::DeepInsight => 0.8,
            TriggerReason::SelfReference => 0.7,
            TriggerReason::Shift => 0.6,
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TriggerReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emotional_peak" => Ok(TriggerReason::EmotionalPeak),
            "self_reference" => Ok(TriggerReason::SelfReference),
            "deep_insight" => Ok(TriggerReason::DeepInsight),
            "personal_revelation" => Ok(TriggerReason::PersonalRevelation),
            "shift" => Ok(TriggerReason::Shift),
            other => Err(format!("unknown trigger reason: {other}")),
        }
    }
}

/// One persisted long-term memory: a user+bot turn pair with its emotional
/// snapshot and the scores that let it through the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtmMemory {
    pub memory_id: String,
    pub user_id: String,
    pub user_text: String,
    pub bot_text: String,
    pub emotional_snapshot: EmotionVector,
    pub dominant_emotions: Vec<String>,
    pub importance_score: f64,
    pub novelty_score: f64,
    pub memory_type: MemoryType,
    pub trigger_reason: TriggerReason,
    pub semantic_tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl LtmMemory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        user_text: &str,
        bot_text: &str,
        emotional_snapshot: EmotionVector,
        dominant_emotions: Vec<String>,
        importance_score: f64,
        novelty_score: f64,
        memory_type: MemoryType,
        trigger_reason: TriggerReason,
        semantic_tags: Vec<String>,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        // An all-zero snapshot carries no signal; fall back to neutral so
        // the stored invariant holds.
        let emotional_snapshot = if emotional_snapshot.is_all_zero() {
            EmotionVector::neutral()
        } else {
            emotional_snapshot
        };
        Self {
            memory_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_text: user_text.to_string(),
            bot_text: bot_text.to_string(),
            emotional_snapshot,
            dominant_emotions,
            importance_score: importance_score.clamp(0.0, 1.0),
            novelty_score: novelty_score.clamp(0.0, 1.0),
            memory_type,
            trigger_reason,
            semantic_tags,
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// Per-user rolling statistics driving the dynamic save threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub total_messages: u64,
    pub emotion_frequencies: BTreeMap<String, u64>,
    pub tag_frequencies: BTreeMap<String, u64>,
    pub recent_novelty_scores: Vec<f64>,
    /// Rolling mean of the emotion vectors seen so far.
    pub emotion_mean: EmotionVector,
    /// Rolling centroid of turn embeddings, when embeddings are available.
    pub embedding_centroid: Option<Vec<f32>>,
    pub current_percentile_90: f64,
    pub calibration_complete: bool,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_messages: 0,
            emotion_frequencies: BTreeMap::new(),
            tag_frequencies: BTreeMap::new(),
            recent_novelty_scores: Vec::new(),
            emotion_mean: EmotionVector::zeros(),
            embedding_centroid: None,
            current_percentile_90: 0.0,
            calibration_complete: false,
            created_at: Utc::now(),
        }
    }

    /// Fold one observed turn into the rolling statistics.
    pub fn absorb(
        &mut self,
        emotions: &EmotionVector,
        tags: &[String],
        embedding: Option<&[f32]>,
        novelty: f64,
        window: usize,
        cold_start_buffer: usize,
    ) {
        self.total_messages += 1;
        let n = self.total_messages as f64;

        for label in emotions.dominant(3) {
            *self.emotion_frequencies.entry(label).or_insert(0) += 1;
        }
        for tag in tags {
            *self.tag_frequencies.entry(tag.clone()).or_insert(0) += 1;
        }

        // Incremental mean: m += (x - m) / n.
        let mut mean = *self.emotion_mean.scores();
        for (m, x) in mean.iter_mut().zip(emotions.scores().iter()) {
            *m += (x - *m) / n;
        }
        self.emotion_mean = EmotionVector::from_scores(mean);

        if let Some(vector) = embedding {
            match &mut self.embedding_centroid {
                Some(centroid) if centroid.len() == vector.len() => {
                    for (c, x) in centroid.iter_mut().zip(vector.iter()) {
                        *c += (x - *c) / n as f32;
                    }
                }
                _ => self.embedding_centroid = Some(vector.to_vec()),
            }
        }

        self.recent_novelty_scores.push(novelty);
        if self.recent_novelty_scores.len() > window {
            let drop = self.recent_novelty_scores.len() - window;
            self.recent_novelty_scores.drain(..drop);
        }
        self.current_percentile_90 = percentile_90(&self.recent_novelty_scores);
        self.calibration_complete = self.total_messages >= cold_start_buffer as u64;
    }

    /// Effective save threshold once calibration is complete.
    pub fn dynamic_threshold(&self, floor: f64) -> f64 {
        (0.9 * self.current_percentile_90).max(floor)
    }

    /// Weight of this profile in aggregate analytics, ramping up around the
    /// 30-day mark.
    pub fn maturity_factor(&self, sigmoid_rate: f64) -> f64 {
        let age_days = (Utc::now() - self.created_at).num_seconds() as f64 / 86_400.0;
        1.0 / (1.0 + (-sigmoid_rate * (age_days - 30.0)).exp())
    }
}

fn percentile_90(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * 0.9).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_flips_exactly_at_buffer_size() {
        let mut profile = UserProfile::new("u1");
        let emotions = EmotionVector::neutral();
        for i in 0..30 {
            assert!(!profile.calibration_complete, "flipped early at {i}");
            profile.absorb(&emotions, &[], None, 0.5, 100, 30);
        }
        assert!(profile.calibration_complete);
        assert_eq!(profile.total_messages, 30);
    }

    #[test]
    fn percentile_tracks_the_window() {
        let mut profile = UserProfile::new("u1");
        let emotions = EmotionVector::neutral();
        for i in 0..10 {
            profile.absorb(&emotions, &[], None, i as f64 / 10.0, 100, 5);
        }
        // Scores 0.0..0.9; p90 over ten entries is the 9th ranked value.
        assert!((profile.current_percentile_90 - 0.8).abs() < 1e-9);
    }

    #[test]
    fn novelty_window_is_bounded() {
        let mut profile = UserProfile::new("u1");
        let emotions = EmotionVector::neutral();
        for _ in 0..20 {
            profile.absorb(&emotions, &[], None, 0.4, 8, 5);
        }
        assert_eq!(profile.recent_novelty_scores.len(), 8);
    }

    #[test]
    fn dynamic_threshold_respects_floor() {
        let mut profile = UserProfile::new("u1");
        profile.current_percentile_90 = 0.85;
        assert!((profile.dynamic_threshold(0.45) - 0.765).abs() < 1e-9);
        profile.current_percentile_90 = 0.2;
        assert!((profile.dynamic_threshold(0.45) - 0.45).abs() < 1e-9);
    }

    #[test]
    fn maturity_is_low_for_new_profiles() {
        let profile = UserProfile::new("u1");
        let factor = profile.maturity_factor(0.1);
        assert!(factor < 0.1, "new profile maturity was {factor}");
    }

    #[test]
    fn all_zero_snapshot_becomes_neutral() {
        let memory = LtmMemory::new(
            "u1",
            "hi",
            "hello",
            EmotionVector::zeros(),
            vec![],
            0.9,
            0.9,
            MemoryType::UserRelated,
            TriggerReason::EmotionalPeak,
            vec![],
            None,
        );
        assert!(!memory.emotional_snapshot.is_all_zero());
    }
}
