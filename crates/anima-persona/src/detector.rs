use serde_json::{Map, Value};
use tracing::debug;

use anima_core::emotion::EmotionVector;
use anima_core::types::GenerationMode;

use crate::style::AnalyzedMessage;

/// Base strength one marker contributes before scaling.
const BASE_STRENGTH: f64 = 0.3;
/// Divisor of the logarithmic marker-count curve.
const LOG_DIVISOR: f64 = 3.0;
/// Manifestations below this strength are dropped.
const DETECTION_THRESHOLD: f64 = 0.3;

/// A detected expression of one of the agent's traits in its own replies.
#[derive(Debug, Clone)]
pub struct TraitManifestation {
    pub trait_name: String,
    pub strength: f64,
    pub markers: Vec<String>,
    pub emotional_context: Map<String, Value>,
}

struct TraitPattern {
    name: &'static str,
    markers: &'static [&'static str],
    /// Affinity of the trait with each generation mode (talk, expert,
    /// creative, base).
    mode_affinity: [f64; 4],
    /// Emotions whose presence amplifies the trait.
    correlated_emotions: &'static [&'static str],
}

const TRAIT_PATTERNS: [TraitPattern; 6] = [
    TraitPattern {
        name: "empathy",
        markers: &[
            "i understand",
            "that sounds",
            "i hear you",
            "must be hard",
            "i'm here",
            "how are you feeling",
        ],
        mode_affinity: [1.0, 0.5, 0.6, 0.5],
        correlated_emotions: &["caring", "sadness", "love"],
    },
    TraitPattern {
        name: "irony",
        markers: &["oh sure", "of course it did", "how surprising", "naturally", "well well"],
        mode_affinity: [0.9, 0.4, 0.8, 0.5],
        correlated_emotions: &["amusement", "annoyance"],
    },
    TraitPattern {
        name: "curiosity",
        markers: &[
            "tell me more",
            "i wonder",
            "what if",
            "how does",
            "why do you think",
            "interesting",
        ],
        mode_affinity: [0.8, 1.0, 0.9, 0.5],
        correlated_emotions: &["curiosity", "surprise", "excitement"],
    },
    TraitPattern {
        name: "caring",
        markers: &["take care", "be gentle with yourself", "rest", "look after", "i worry"],
        mode_affinity: [1.0, 0.4, 0.5, 0.5],
        correlated_emotions: &["caring", "love", "nervousness"],
    },
    TraitPattern {
        name: "playfulness",
        markers: &["let's play", "guess what", "haha", "fun", "silly"],
        mode_affinity: [1.0, 0.3, 0.9, 0.5],
        correlated_emotions: &["amusement", "joy", "excitement"],
    },
    TraitPattern {
        name: "philosophical",
        markers: &[
            "meaning of",
            "in the end",
            "what really matters",
            "perhaps existence",
            "the nature of",
        ],
        mode_affinity: [0.6, 0.9, 1.0, 0.5],
        correlated_emotions: &["realization", "curiosity"],
    },
];

/// Scans the bot's side of recent history for linguistic markers of its
/// own traits.
pub struct TraitDetector;

impl TraitDetector {
    /// Detect manifestations across `messages`, scaled by mode affinity
    /// and the current emotional context. The marker count contributes
    /// logarithmically so verbose replies do not explode the strength.
    pub fn detect(
        messages: &[AnalyzedMessage],
        mode: Option<GenerationMode>,
        emotions: Option<&EmotionVector>,
    ) -> Vec<TraitManifestation> {
        let bot_text: Vec<String> = messages
            .iter()
            .filter(|m| !m.from_user)
            .map(|m| m.content.to_lowercase())
            .collect();
        if bot_text.is_empty() {
            return Vec::new();
        }

        let mut manifestations = Vec::new();
        for pattern in &TRAIT_PATTERNS {
            let mut found: Vec<String> = Vec::new();
            for marker in pattern.markers {
                if bot_text.iter().any(|text| text.contains(marker)) {
                    found.push((*marker).to_string());
                }
            }
            if found.is_empty() {
                continue;
            }

            let base = BASE_STRENGTH * (1.0 + (found.len() as f64).ln() / LOG_DIVISOR);

            let affinity = match mode {
                Some(mode) => pattern.mode_affinity[mode_index(mode)],
                None => {
                    pattern.mode_affinity.iter().sum::<f64>() / pattern.mode_affinity.len() as f64
                }
            };

            let emotion_boost = match emotions {
                Some(vector) => {
                    let correlated: f64 = pattern
                        .correlated_emotions
                        .iter()
                        .map(|label| vector.get(label))
                        .fold(0.0, f64::max);
                    1.0 + correlated * 0.5
                }
                None => 1.0,
            };

            let strength = (base * affinity * emotion_boost).clamp(0.0, 1.0);
            if strength < DETECTION_THRESHOLD {
                debug!(
                    trait_name = pattern.name,
                    strength, "trait below detection threshold"
                );
                continue;
            }

            let mut emotional_context = Map::new();
            if let Some(vector) = emotions {
                for label in vector.dominant(3) {
                    emotional_context.insert(label.clone(), Value::from(vector.get(&label)));
                }
            }

            manifestations.push(TraitManifestation {
                trait_name: pattern.name.to_string(),
                strength,
                markers: found,
                emotional_context,
            });
        }
        manifestations
    }
}

fn mode_index(mode: GenerationMode) -> usize {
    match mode {
        GenerationMode::Talk => 0,
        GenerationMode::Expert => 1,
        GenerationMode::Creative => 2,
        GenerationMode::Base => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot(content: &str) -> AnalyzedMessage {
        AnalyzedMessage {
            content: content.to_string(),
            from_user: false,
        }
    }

    #[test]
    fn detects_empathy_markers_in_bot_messages() {
        let messages = vec![
            bot("i understand, that sounds exhausting. i'm here for you."),
            bot("must be hard to carry all of that."),
        ];
        let traits = TraitDetector::detect(&messages, Some(GenerationMode::Talk), None);
        let empathy = traits.iter().find(|t| t.trait_name == "empathy").unwrap();
        assert!(empathy.strength >= DETECTION_THRESHOLD);
        assert!(empathy.markers.len() >= 3);
    }

    #[test]
    fn user_messages_do_not_trigger_traits() {
        let messages = vec![AnalyzedMessage {
            content: "i understand everything, i'm here".into(),
            from_user: true,
        }];
        assert!(TraitDetector::detect(&messages, None, None).is_empty());
    }

    #[test]
    fn marker_count_grows_strength_logarithmically() {
        let one = TraitDetector::detect(
            &[bot("tell me more about it")],
            Some(GenerationMode::Expert),
            None,
        );
        let many = TraitDetector::detect(
            &[bot("tell me more, i wonder what if this works, how does it feel? interesting, why do you think so")],
            Some(GenerationMode::Expert),
            None,
        );
        let s1 = one.iter().find(|t| t.trait_name == "curiosity").unwrap().strength;
        let s5 = many.iter().find(|t| t.trait_name == "curiosity").unwrap().strength;
        assert!(s5 > s1);
        // Five markers are nowhere near five times one marker.
        assert!(s5 < s1 * 3.0);
    }

    #[test]
    fn correlated_emotion_amplifies_strength() {
        let mut emotions = EmotionVector::zeros();
        emotions.set("amusement", 0.9);
        let plain = TraitDetector::detect(&[bot("oh sure, how surprising")], Some(GenerationMode::Talk), None);
        let amplified =
            TraitDetector::detect(&[bot("oh sure, how surprising")], Some(GenerationMode::Talk), Some(&emotions));
        let p = plain.iter().find(|t| t.trait_name == "irony").unwrap().strength;
        let a = amplified.iter().find(|t| t.trait_name == "irony").unwrap().strength;
        assert!(a > p);
    }
}
