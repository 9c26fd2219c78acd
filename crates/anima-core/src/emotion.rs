use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed label order of the 28-class emotion taxonomy produced by the
/// classifier. Index positions are part of the persisted format; never
/// reorder.
pub const EMOTION_LABELS: [&str; 28] = [
    "admiration",
    "amusement",
    "anger",
    "annoyance",
    "approval",
    "caring",
    "confusion",
    "curiosity",
    "desire",
    "disappointment",
    "disapproval",
    "disgust",
    "embarrassment",
    "excitement",
    "fear",
    "gratitude",
    "grief",
    "joy",
    "love",
    "nervousness",
    "optimism",
    "pride",
    "realization",
    "relief",
    "remorse",
    "sadness",
    "surprise",
    "neutral",
];

/// Index of the `neutral` label in [`EMOTION_LABELS`].
pub const NEUTRAL_INDEX: usize = 27;

/// Dense 28-dimensional emotion score vector.
///
/// Hot paths work on the fixed-order array; the string labels only appear
/// when serializing for persistence or logging.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionVector {
    scores: [f64; 28],
}

impl EmotionVector {
    pub fn zeros() -> Self {
        Self { scores: [0.0; 28] }
    }

    /// The fallback vector used when the classifier fails or times out.
    pub fn neutral() -> Self {
        let mut v = Self::zeros();
        v.scores[NEUTRAL_INDEX] = 1.0;
        v
    }

    pub fn from_scores(scores: [f64; 28]) -> Self {
        Self { scores }
    }

    /// Build from a labeled map; unknown labels are ignored.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Self {
        let mut v = Self::zeros();
        for (label, score) in map {
            if let Some(idx) = label_index(label) {
                v.scores[idx] = *score;
            }
        }
        v
    }

    pub fn scores(&self) -> &[f64; 28] {
        &self.scores
    }

    pub fn get(&self, label: &str) -> f64 {
        label_index(label).map(|i| self.scores[i]).unwrap_or(0.0)
    }

    pub fn set(&mut self, label: &str, score: f64) {
        if let Some(idx) = label_index(label) {
            self.scores[idx] = score;
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.scores.iter().all(|s| *s == 0.0)
    }

    /// Peak component; emotional intensity for the importance scorer.
    pub fn max_score(&self) -> f64 {
        self.scores.iter().copied().fold(0.0, f64::max)
    }

    /// Labels ranked by score, strongest first, zero scores skipped.
    pub fn dominant(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<(usize, f64)> = self
            .scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(n)
            .map(|(i, _)| EMOTION_LABELS[i].to_string())
            .collect()
    }

    /// Labeled map for persistence and event payloads. Zero scores are kept
    /// so the stored snapshot is always complete.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        EMOTION_LABELS
            .iter()
            .zip(self.scores.iter())
            .map(|(l, s)| (l.to_string(), *s))
            .collect()
    }

    /// Euclidean distance to another vector; the emotional-novelty factor
    /// measures deviation from the user's rolling mean with this.
    pub fn distance(&self, other: &EmotionVector) -> f64 {
        self.scores
            .iter()
            .zip(other.scores.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

impl Serialize for EmotionVector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EmotionVector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, f64>::deserialize(deserializer)?;
        Ok(EmotionVector::from_map(&map))
    }
}

fn label_index(label: &str) -> Option<usize> {
    EMOTION_LABELS.iter().position(|l| *l == label)
}

/// Cosine similarity between two embedding vectors. Returns 0.0 when either
/// vector is empty or has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_vector_is_not_all_zero() {
        let v = EmotionVector::neutral();
        assert!(!v.is_all_zero());
        assert_eq!(v.get("neutral"), 1.0);
        assert_eq!(v.dominant(3), vec!["neutral".to_string()]);
    }

    #[test]
    fn dominant_ranks_by_score() {
        let mut v = EmotionVector::zeros();
        v.set("joy", 0.4);
        v.set("excitement", 0.9);
        v.set("fear", 0.1);
        assert_eq!(v.dominant(2), vec!["excitement", "joy"]);
        assert!((v.max_score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn map_round_trip_preserves_scores() {
        let mut v = EmotionVector::zeros();
        v.set("sadness", 0.7);
        v.set("grief", 0.2);
        let restored = EmotionVector::from_map(&v.to_map());
        assert_eq!(restored, v);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let a = vec![0.5f32, 0.1, -0.3];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }
}
