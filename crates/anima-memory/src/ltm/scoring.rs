use anima_core::emotion::{cosine_similarity, EmotionVector};

use crate::ltm::types::{MemoryType, TriggerReason, UserProfile};

/// Blend weights for the three novelty factors.
const SEMANTIC_WEIGHT: f64 = 0.40;
const EMOTIONAL_WEIGHT: f64 = 0.35;
const CONTEXTUAL_WEIGHT: f64 = 0.25;

/// Neutral factor value when the signal is unavailable (no embedding yet,
/// no tag history).
const NEUTRAL_FACTOR: f64 = 0.5;

/// Emotional intensity above which a turn counts as an emotional peak.
const PEAK_INTENSITY: f64 = 0.8;

/// Importance blend weights: intensity, trigger class, content heuristics.
const INTENSITY_WEIGHT: f64 = 0.5;
const TRIGGER_WEIGHT: f64 = 0.4;
const CONTENT_WEIGHT: f64 = 0.1;

const STOPWORDS: [&str; 24] = [
    "about", "after", "again", "because", "being", "could", "every", "first", "having", "other",
    "really", "should", "since", "something", "their", "there", "these", "thing", "think",
    "those", "today", "where", "which", "would",
];

/// Novelty factors for one turn, each in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct NoveltyScore {
    pub semantic: f64,
    pub emotional: f64,
    pub contextual: f64,
    pub composite: f64,
}

/// Score how unfamiliar a turn is relative to the user's rolling profile.
///
/// Semantic: cosine distance between the turn's embedding and the rolling
/// centroid. Emotional: deviation of the emotion vector from the rolling
/// mean. Contextual: rarity of the extracted tags in the tag histogram.
/// Missing signals contribute the neutral 0.5.
pub fn novelty_score(
    profile: &UserProfile,
    emotions: &EmotionVector,
    embedding: Option<&[f32]>,
    tags: &[String],
) -> NoveltyScore {
    let semantic = match (embedding, profile.embedding_centroid.as_deref()) {
        (Some(vector), Some(centroid)) if !centroid.is_empty() => {
            // cosine in [-1, 1] → distance in [0, 1].
            ((1.0 - cosine_similarity(vector, centroid)) / 2.0).clamp(0.0, 1.0)
        }
        _ => NEUTRAL_FACTOR,
    };

    let emotional = if profile.total_messages == 0 {
        NEUTRAL_FACTOR
    } else {
        (emotions.distance(&profile.emotion_mean) / 2.0).clamp(0.0, 1.0)
    };

    let contextual = if tags.is_empty() || profile.tag_frequencies.is_empty() {
        NEUTRAL_FACTOR
    } else {
        let rarity_sum: f64 = tags
            .iter()
            .map(|tag| {
                let seen = profile.tag_frequencies.get(tag).copied().unwrap_or(0);
                1.0 / (1.0 + seen as f64)
            })
            .sum();
        (rarity_sum / tags.len() as f64).clamp(0.0, 1.0)
    };

    let composite = (SEMANTIC_WEIGHT * semantic
        + EMOTIONAL_WEIGHT * emotional
        + CONTEXTUAL_WEIGHT * contextual)
        .clamp(0.0, 1.0);

    NoveltyScore {
        semantic,
        emotional,
        contextual,
        composite,
    }
}

/// Classify why this turn might be worth remembering.
pub fn classify_trigger(emotions: &EmotionVector, user_text: &str) -> TriggerReason {
    let text = user_text.to_lowercase();
    if emotions.max_score() >= PEAK_INTENSITY {
        TriggerReason::EmotionalPeak
    } else if ["never told", "secret", "confess", "between us"]
        .iter()
        .any(|m| text.contains(m))
    {
        TriggerReason::PersonalRevelation
    } else if ["i realize", "i realized", "now i understand", "it dawned on me"]
        .iter()
        .any(|m| text.contains(m))
    {
        TriggerReason::DeepInsight
    } else if ["i feel", "i am ", "i'm ", "my life", "myself"]
        .iter()
        .any(|m| text.contains(m))
    {
        TriggerReason::SelfReference
    } else {
        TriggerReason::Shift
    }
}

/// Bounded importance score for one turn.
pub fn importance_score(
    emotions: &EmotionVector,
    trigger: TriggerReason,
    user_text: &str,
) -> f64 {
    let intensity = emotions.max_score();

    let text = user_text.to_lowercase();
    let mut content: f64 = 0.0;
    if user_text.chars().count() > 120 {
        content += 0.4;
    }
    if text.contains('?') {
        content += 0.2;
    }
    if ["always", "never", "most important", "everything"]
        .iter()
        .any(|m| text.contains(m))
    {
        content += 0.4;
    }

    (INTENSITY_WEIGHT * intensity + TRIGGER_WEIGHT * trigger.weight()
        + CONTENT_WEIGHT * content.min(1.0))
    .clamp(0.0, 1.0)
}

/// Classify whose world the turn is about.
pub fn classify_memory_type(user_text: &str, bot_text: &str) -> MemoryType {
    let user = user_text.to_lowercase();
    let bot = bot_text.to_lowercase();
    if ["you are", "you're", "about you", "do you"]
        .iter()
        .any(|m| user.contains(m))
        || ["i am", "i'm", "i feel"].iter().any(|m| bot.contains(m))
    {
        MemoryType::SelfRelated
    } else if ["i ", "my ", "me ", "mine"].iter().any(|m| user.contains(m)) {
        MemoryType::UserRelated
    } else {
        MemoryType::WorldRelated
    }
}

/// Crude keyword extraction: lowercase words of five or more letters, minus
/// stopwords, deduplicated in order of first appearance, capped at eight.
pub fn semantic_tags(user_text: &str, bot_text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in user_text.split_whitespace().chain(bot_text.split_whitespace()) {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect::<String>()
            .to_lowercase();
        if cleaned.chars().count() < 5 || STOPWORDS.contains(&cleaned.as_str()) {
            continue;
        }
        if !tags.contains(&cleaned) {
            tags.push(cleaned);
        }
        if tags.len() >= 8 {
            break;
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_intensity_is_an_emotional_peak() {
        let mut emotions = EmotionVector::zeros();
        emotions.set("excitement", 0.95);
        assert_eq!(
            classify_trigger(&emotions, "wow this is great"),
            TriggerReason::EmotionalPeak
        );
    }

    #[test]
    fn self_reference_detected_below_peak() {
        let mut emotions = EmotionVector::zeros();
        emotions.set("sadness", 0.4);
        assert_eq!(
            classify_trigger(&emotions, "i feel lost these days"),
            TriggerReason::SelfReference
        );
    }

    #[test]
    fn importance_is_bounded() {
        let mut emotions = EmotionVector::zeros();
        emotions.set("joy", 1.0);
        let score = importance_score(
            &emotions,
            TriggerReason::EmotionalPeak,
            "the most important thing that always mattered to me? everything.",
        );
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.8);
    }

    #[test]
    fn novelty_uses_neutral_factors_without_history() {
        let profile = UserProfile::new("u1");
        let score = novelty_score(&profile, &EmotionVector::neutral(), None, &[]);
        assert!((score.semantic - 0.5).abs() < 1e-9);
        assert!((score.emotional - 0.5).abs() < 1e-9);
        assert!((score.contextual - 0.5).abs() < 1e-9);
        assert!((score.composite - 0.5).abs() < 1e-9);
    }

    #[test]
    fn repeated_tags_lower_contextual_novelty() {
        let mut profile = UserProfile::new("u1");
        let emotions = EmotionVector::neutral();
        let tags = vec!["guitar".to_string(), "music".to_string()];
        for _ in 0..10 {
            profile.absorb(&emotions, &tags, None, 0.5, 100, 30);
        }
        let familiar = novelty_score(&profile, &emotions, None, &tags);
        let fresh_tags = vec!["astronomy".to_string()];
        let fresh = novelty_score(&profile, &emotions, None, &fresh_tags);
        assert!(fresh.contextual > familiar.contextual);
    }

    #[test]
    fn identical_embedding_scores_low_semantic_novelty() {
        let mut profile = UserProfile::new("u1");
        let emotions = EmotionVector::neutral();
        let embedding = vec![0.5f32; 8];
        profile.absorb(&emotions, &[], Some(&embedding), 0.5, 100, 30);
        let score = novelty_score(&profile, &emotions, Some(&embedding), &[]);
        assert!(score.semantic < 0.05);
    }

    #[test]
    fn tags_skip_stopwords_and_short_words(){
        let tags = semantic_tags("I think the guitar is really something", "playing guitar daily");
        assert!(tags.contains(&"guitar".to_string()));
        assert!(!tags.contains(&"think".to_string()));
        assert!(!tags.contains(&"the".to_string()));
        // Deduplicated.
        assert_eq!(tags.iter().filter(|t| *t == "guitar").count(), 1);
    }
}
