use std::collections::BTreeMap;
use tracing::debug;

use anima_core::config::ModeConfig;
use anima_core::types::GenerationMode;

use crate::session::Session;

/// Weight multiplier for an exact phrase match (tier 1).
const PHRASE_WEIGHT: f64 = 2.0;
/// Weight multiplier for domain markers (tier 3).
const DOMAIN_WEIGHT: f64 = 0.5;
/// Score multiplier when an enhancer accompanies a contextual word.
const ENHANCER_MULTIPLIER: f64 = 1.5;
/// Score multiplier when a suppressor accompanies a contextual word.
/// Zero kills the word's contribution entirely.
const SUPPRESSOR_MULTIPLIER: f64 = 0.0;
/// Added to the expert score when a question word is present.
const QUESTION_BONUS: f64 = 1.0;

/// A contextual word whose contribution is modulated by nearby enhancers
/// and suppressors (tier 2).
#[derive(Debug, Clone)]
pub struct ContextualWord {
    pub word: &'static str,
    pub enhancers: &'static [&'static str],
    pub suppressors: &'static [&'static str],
}

/// Per-mode scoring vocabulary.
#[derive(Debug, Clone)]
pub struct ModePatterns {
    pub weight: f64,
    pub exact_phrases: &'static [&'static str],
    pub contextual_words: &'static [ContextualWord],
    pub domain_markers: &'static [&'static str],
    pub fallback_patterns: &'static [&'static str],
}

/// The full detection vocabulary: three scored tiers per candidate mode
/// plus the simple-pattern fallback and the question-word list.
#[derive(Debug, Clone)]
pub struct ModeLexicon {
    pub talk: ModePatterns,
    pub expert: ModePatterns,
    pub creative: ModePatterns,
    pub question_words: &'static [&'static str],
}

impl ModeLexicon {
    fn patterns(&self, mode: GenerationMode) -> &ModePatterns {
        match mode {
            GenerationMode::Expert => &self.expert,
            GenerationMode::Creative => &self.creative,
            _ => &self.talk,
        }
    }
}

impl Default for ModeLexicon {
    fn default() -> Self {
        Self {
            talk: ModePatterns {
                weight: 1.5,
                exact_phrases: &["how are you", "i missed you", "tell me about your day"],
                contextual_words: &[
                    ContextualWord {
                        word: "feel",
                        enhancers: &["i", "really", "today"],
                        suppressors: &["function", "button"],
                    },
                    ContextualWord {
                        word: "lonely",
                        enhancers: &["so", "been"],
                        suppressors: &[],
                    },
                    ContextualWord {
                        word: "miss",
                        enhancers: &["you", "him", "her"],
                        suppressors: &["deadline", "target"],
                    },
                ],
                domain_markers: &["friend", "family", "weekend", "mood", "dream", "tired"],
                fallback_patterns: &["hello", "hey", "what's up", "good morning", "good night"],
            },
            expert: ModePatterns {
                weight: 2.0,
                exact_phrases: &["explain to me", "help me understand", "what is the difference"],
                contextual_words: &[
                    ContextualWord {
                        word: "explain",
                        enhancers: &["how", "why", "detail"],
                        suppressors: &["joke"],
                    },
                    ContextualWord {
                        word: "problem",
                        enhancers: &["solve", "fix", "debug"],
                        suppressors: &["no problem"],
                    },
                    ContextualWord {
                        word: "compare",
                        enhancers: &["versus", "options"],
                        suppressors: &[],
                    },
                ],
                domain_markers: &[
                    "algorithm", "theory", "analysis", "research", "database", "formula",
                    "protocol",
                ],
                fallback_patterns: &["how does", "why does", "what causes"],
            },
            creative: ModePatterns {
                weight: 2.0,
                exact_phrases: &["write me a story", "let's imagine", "make up a"],
                contextual_words: &[
                    ContextualWord {
                        word: "story",
                        enhancers: &["write", "tell", "invent"],
                        suppressors: &["true story"],
                    },
                    ContextualWord {
                        word: "imagine",
                        enhancers: &["world", "character", "place"],
                        suppressors: &[],
                    },
                    ContextualWord {
                        word: "poem",
                        enhancers: &["write", "compose"],
                        suppressors: &[],
                    },
                ],
                domain_markers: &["fantasy", "character", "plot", "verse", "metaphor", "fairy"],
                fallback_patterns: &["once upon", "write something", "invent"],
            },
            question_words: &["what", "why", "how", "when", "where", "which"],
        }
    }
}

/// Per-mode detection trace kept for diagnostics events.
#[derive(Debug, Clone, Default)]
pub struct DetectionDetails {
    pub matched: BTreeMap<String, Vec<String>>,
    pub scores: BTreeMap<String, f64>,
}

/// Contextual pattern scorer for the generation mode.
pub struct ModeDetector {
    lexicon: ModeLexicon,
    config: ModeConfig,
}

impl ModeDetector {
    pub fn new(lexicon: ModeLexicon, config: ModeConfig) -> Self {
        Self { lexicon, config }
    }

    /// Decide `(mode, confidence)` for one user message.
    ///
    /// A confident partner-persona recommendation overrides text scoring.
    /// Otherwise the three tiers run per mode; if all score zero the simple
    /// fallback patterns apply. A three-long agreeing mode history
    /// multiplies the confidence by the stability factor.
    pub fn detect(
        &self,
        text: &str,
        session: &Session,
        partner_mode: Option<GenerationMode>,
        partner_confidence: f64,
    ) -> (GenerationMode, f64, DetectionDetails) {
        let mut details = DetectionDetails::default();

        if text.chars().count() < self.config.min_text_length {
            return (session.current_mode, 0.5, details);
        }

        if let Some(mode) = partner_mode {
            if partner_confidence > self.config.partner_confidence_threshold {
                debug!(
                    mode = mode.as_str(),
                    confidence = partner_confidence,
                    "using partner persona recommendation"
                );
                return (mode, partner_confidence.min(1.0), details);
            }
        }

        let text_lower = text.to_lowercase();
        let mut scores: BTreeMap<GenerationMode, f64> = GenerationMode::detectable()
            .into_iter()
            .map(|m| (m, 0.0))
            .collect();

        for mode in GenerationMode::detectable() {
            let patterns = self.lexicon.patterns(mode);
            let score = scores.get_mut(&mode).unwrap();
            let trace = details.matched.entry(mode.as_str().to_string()).or_default();

            // Tier 1: exact phrases.
            for phrase in patterns.exact_phrases {
                if text_lower.contains(phrase) {
                    *score += patterns.weight * PHRASE_WEIGHT;
                    trace.push(format!("exact_phrase:{phrase}"));
                }
            }

            // Tier 2: contextual words modulated by enhancers/suppressors.
            for contextual in patterns.contextual_words {
                if !text_lower.contains(contextual.word) {
                    continue;
                }
                let mut word_score = patterns.weight;
                if let Some(enhancer) = contextual
                    .enhancers
                    .iter()
                    .find(|e| text_lower.contains(**e))
                {
                    word_score *= ENHANCER_MULTIPLIER;
                    trace.push(format!("enhanced:{}+{enhancer}", contextual.word));
                }
                if let Some(suppressor) = contextual
                    .suppressors
                    .iter()
                    .find(|s| text_lower.contains(**s))
                {
                    word_score *= SUPPRESSOR_MULTIPLIER;
                    trace.push(format!("suppressed:{}-{suppressor}", contextual.word));
                    if SUPPRESSOR_MULTIPLIER == 0.0 {
                        continue;
                    }
                }
                *score += word_score;
            }

            // Tier 3: domain markers, logarithmic in their count.
            let domain_count = patterns
                .domain_markers
                .iter()
                .filter(|m| text_lower.contains(**m))
                .count();
            if domain_count > 0 {
                *score += patterns.weight * DOMAIN_WEIGHT * (1.0 + (domain_count as f64).ln());
                trace.push(format!("domains:{domain_count}"));
            }
        }

        // Fallback: simple pattern lists when every tier scored zero.
        if scores.values().all(|s| *s == 0.0) {
            for mode in GenerationMode::detectable() {
                let patterns = self.lexicon.patterns(mode);
                for pattern in patterns.fallback_patterns {
                    if text_lower.contains(pattern) {
                        *scores.get_mut(&mode).unwrap() += patterns.weight;
                        details
                            .matched
                            .entry(mode.as_str().to_string())
                            .or_default()
                            .push(format!("simple:{pattern}"));
                    }
                }
            }
        }

        // Question words lean expert.
        if self
            .lexicon
            .question_words
            .iter()
            .any(|q| text_lower.contains(*q))
        {
            *scores.get_mut(&GenerationMode::Expert).unwrap() += QUESTION_BONUS;
            details
                .matched
                .entry("expert".to_string())
                .or_default()
                .push("question_bonus".to_string());
        }

        for (mode, score) in &scores {
            details.scores.insert(mode.as_str().to_string(), *score);
        }

        let (detected, max_score) = scores
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(m, s)| (*m, *s))
            .unwrap_or((GenerationMode::Talk, 0.0));

        let (detected, mut confidence) = if max_score == 0.0 {
            (GenerationMode::Talk, self.config.confidence_threshold)
        } else {
            (
                detected,
                (max_score / self.config.score_normalization_factor).min(1.0),
            )
        };

        if session.stable_mode_streak() == Some(detected) {
            confidence = (confidence * self.config.stable_history_multiplier).min(1.0);
            details
                .matched
                .entry(detected.as_str().to_string())
                .or_default()
                .push("history_boost".to_string());
        }

        (detected, confidence, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ModeDetector {
        ModeDetector::new(ModeLexicon::default(), ModeConfig::default())
    }

    fn session() -> Session {
        Session::new("u1", None)
    }

    #[test]
    fn empty_scores_fall_back_to_talk() {
        let (mode, confidence, _) = detector().detect("zzz qqq", &session(), None, 0.0);
        assert_eq!(mode, GenerationMode::Talk);
        assert!((confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn exact_phrase_wins_for_expert() {
        let (mode, confidence, details) =
            detector().detect("please explain to me the theory behind this", &session(), None, 0.0);
        assert_eq!(mode, GenerationMode::Expert);
        assert!(confidence > 0.3);
        assert!(details.matched["expert"]
            .iter()
            .any(|m| m.starts_with("exact_phrase")));
    }

    #[test]
    fn suppressor_kills_contextual_word() {
        let with_suppressor = detector().detect(
            "there is no problem at all over here believe it",
            &session(),
            None,
            0.0,
        );
        let without = detector().detect(
            "can you solve this problem over here believe it",
            &session(),
            None,
            0.0,
        );
        let s1 = with_suppressor.2.scores["expert"];
        let s2 = without.2.scores["expert"];
        assert!(s2 > s1, "suppressed {s1} vs enhanced {s2}");
    }

    #[test]
    fn question_words_boost_expert() {
        let (mode, _, details) =
            detector().detect("why is the sky blue today then", &session(), None, 0.0);
        assert_eq!(mode, GenerationMode::Expert);
        assert!(details.matched["expert"].contains(&"question_bonus".to_string()));
    }

    #[test]
    fn partner_recommendation_overrides_text() {
        let (mode, confidence, _) = detector().detect(
            "please explain to me the theory behind this",
            &session(),
            Some(GenerationMode::Creative),
            0.9,
        );
        assert_eq!(mode, GenerationMode::Creative);
        assert!((confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn low_partner_confidence_is_ignored() {
        let (mode, _, _) = detector().detect(
            "please explain to me the theory behind this",
            &session(),
            Some(GenerationMode::Creative),
            0.3,
        );
        assert_eq!(mode, GenerationMode::Expert);
    }

    #[test]
    fn stable_history_multiplies_confidence() {
        let mut stable = session();
        for _ in 0..3 {
            stable.push_mode(GenerationMode::Expert, 0.8, 10);
        }
        let text = "please explain to me the theory behind this";
        let (_, base_confidence, _) = detector().detect(text, &session(), None, 0.0);
        let (mode, boosted, details) = detector().detect(text, &stable, None, 0.0);
        assert_eq!(mode, GenerationMode::Expert);
        assert!(boosted > base_confidence);
        assert!(details.matched["expert"].contains(&"history_boost".to_string()));
    }

    #[test]
    fn short_text_keeps_current_mode() {
        let mut s = session();
        s.push_mode(GenerationMode::Creative, 0.8, 10);
        let (mode, confidence, _) = detector().detect("ok", &s, None, 0.0);
        assert_eq!(mode, GenerationMode::Creative);
        assert!((confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn domain_markers_grow_logarithmically() {
        let one = detector().detect("the algorithm", &session(), None, 0.0);
        let many = detector().detect(
            "the algorithm analysis research database protocol",
            &session(),
            None,
            0.0,
        );
        let s1 = one.2.scores["expert"];
        let s5 = many.2.scores["expert"];
        assert!(s5 > s1);
        assert!(s5 < s1 * 5.0);
    }
}
