use anima_core::types::StyleVector;

/// Messages required before the analyzer trusts its own output.
pub const MIN_MESSAGES: usize = 5;

/// Confidence reported with the neutral fallback vector.
const FALLBACK_CONFIDENCE: f64 = 0.1;

/// How strongly older messages are discounted (0 = no decay).
const DECAY_FACTOR: f64 = 0.5;

const EMOJI_WEIGHT: f64 = 0.15;
const EMOJI_MAX: f64 = 0.45;
const EXCLAMATION_WEIGHT: f64 = 0.2;
const LAUGHTER_WEIGHT: f64 = 0.3;
const INFORMAL_WEIGHT: f64 = 0.1;
const INFORMAL_MAX: f64 = 0.3;

const LONG_SENTENCE_WEIGHT: f64 = 0.25;
const VERY_LONG_SENTENCE_WEIGHT: f64 = 0.4;
const FORMAL_WEIGHT: f64 = 0.2;
const QUESTION_WEIGHT: f64 = 0.15;
const NO_EMOJI_WEIGHT: f64 = 0.2;

const INTENSIFIER_WEIGHT: f64 = 0.15;
const INTENSIFIER_MAX: f64 = 0.45;
const EMOTIVE_PUNCTUATION_WEIGHT: f64 = 0.25;

const COMPARISON_WEIGHT: f64 = 0.3;
const UNUSUAL_PUNCTUATION_WEIGHT: f64 = 0.15;
const UNIQUENESS_WEIGHT: f64 = 0.4;
const LENGTH_VARIETY_WEIGHT: f64 = 0.15;

const LAUGHTER_MARKERS: [&str; 4] = ["haha", "lol", "lmao", "hehe"];
const INFORMAL_MARKERS: [&str; 8] = ["gonna", "wanna", "kinda", "sorta", "yeah", "nah", "yep", "dunno"];
const FORMAL_MARKERS: [&str; 8] = [
    "therefore",
    "however",
    "moreover",
    "regarding",
    "consequently",
    "furthermore",
    "accordingly",
    "nevertheless",
];
const INTENSIFIERS: [&str; 8] = [
    "very",
    "really",
    "absolutely",
    "totally",
    "incredibly",
    "extremely",
    "so much",
    "completely",
];
const COMPARISON_MARKERS: [&str; 5] = ["like a", "as if", "reminds me of", "imagine", "as though"];

/// One conversation message as seen by the analyzers.
#[derive(Debug, Clone)]
pub struct AnalyzedMessage {
    pub content: String,
    /// True for the interlocutor's messages, false for the bot's.
    pub from_user: bool,
}

/// Result of one style pass over recent history.
#[derive(Debug, Clone)]
pub struct StyleAnalysis {
    pub vector: StyleVector,
    pub confidence: f64,
    pub messages_analyzed: usize,
}

impl StyleAnalysis {
    pub fn neutral() -> Self {
        Self {
            vector: StyleVector::neutral(),
            confidence: FALLBACK_CONFIDENCE,
            messages_analyzed: 0,
        }
    }
}

/// Extract a 4-component style vector from the user's side of the history.
///
/// Messages are expected oldest → newest; each feature score is
/// time-decayed so the most recent messages dominate. Below
/// [`MIN_MESSAGES`] the neutral vector is returned with low confidence.
pub fn analyze_style(messages: &[AnalyzedMessage]) -> StyleAnalysis {
    let user_messages: Vec<&AnalyzedMessage> =
        messages.iter().filter(|m| m.from_user).collect();
    if user_messages.len() < MIN_MESSAGES {
        return StyleAnalysis::neutral();
    }

    let vector = StyleVector {
        playfulness: decayed_score(&user_messages, playfulness_features),
        seriousness: decayed_score(&user_messages, seriousness_features),
        emotionality: decayed_score(&user_messages, emotionality_features),
        creativity: creativity_score(&user_messages),
    }
    .clamped();

    StyleAnalysis {
        vector,
        confidence: confidence(&user_messages),
        messages_analyzed: user_messages.len(),
    }
}

/// Weighted average of per-message feature scores, older messages
/// discounted linearly by [`DECAY_FACTOR`]. Messages come oldest first, so
/// the weight grows with the index.
fn decayed_score(messages: &[&AnalyzedMessage], features: fn(&str) -> f64) -> f64 {
    let n = messages.len() as f64;
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (i, message) in messages.iter().enumerate() {
        let age = (n - 1.0 - i as f64) / n;
        let weight = 1.0 - age * DECAY_FACTOR;
        weighted += features(&message.content.to_lowercase()) * weight;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        0.5
    } else {
        (weighted / total_weight).clamp(0.0, 1.0)
    }
}

fn playfulness_features(text: &str) -> f64 {
    let mut score = 0.0;
    let emoji_count = text.chars().filter(|c| {
        matches!(*c as u32, 0x1F300..=0x1FAFF | 0x2600..=0x27BF)
    }).count();
    score += (emoji_count as f64 * EMOJI_WEIGHT).min(EMOJI_MAX);
    if text.contains("!!") || text.matches('!').count() >= 2 {
        score += EXCLAMATION_WEIGHT;
    }
    if LAUGHTER_MARKERS.iter().any(|m| text.contains(m)) {
        score += LAUGHTER_WEIGHT;
    }
    let informal = INFORMAL_MARKERS.iter().filter(|m| text.contains(*m)).count();
    score += (informal as f64 * INFORMAL_WEIGHT).min(INFORMAL_MAX);
    score.min(1.0)
}

fn seriousness_features(text: &str) -> f64 {
    let mut score = 0.0;
    let words = text.split_whitespace().count();
    let sentences = text.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count().max(1);
    let avg_sentence = words as f64 / sentences as f64;
    if avg_sentence > 20.0 {
        score += VERY_LONG_SENTENCE_WEIGHT;
    } else if avg_sentence > 12.0 {
        score += LONG_SENTENCE_WEIGHT;
    }
    if FORMAL_MARKERS.iter().any(|m| text.contains(m)) {
        score += FORMAL_WEIGHT;
    }
    if text.contains('?') && words > 8 {
        score += QUESTION_WEIGHT;
    }
    let has_emoji = text.chars().any(|c| matches!(c as u32, 0x1F300..=0x1FAFF | 0x2600..=0x27BF));
    if !has_emoji && !LAUGHTER_MARKERS.iter().any(|m| text.contains(m)) {
        score += NO_EMOJI_WEIGHT;
    }
    score.min(1.0)
}

fn emotionality_features(text: &str) -> f64 {
    let mut score = 0.0;
    let intensifiers = INTENSIFIERS.iter().filter(|m| text.contains(*m)).count();
    score += (intensifiers as f64 * INTENSIFIER_WEIGHT).min(INTENSIFIER_MAX);
    if text.contains("!!!") || text.contains("??") || text.contains("...") {
        score += EMOTIVE_PUNCTUATION_WEIGHT;
    }
    let caps_words = text
        .split_whitespace()
        .filter(|w| w.len() > 2 && w.chars().all(|c| c.is_uppercase()))
        .count();
    if caps_words > 0 {
        score += 0.2;
    }
    score.min(1.0)
}

/// Creativity blends per-message markers with corpus-level variety, so it
/// gets its own pass instead of the shared decayed feature fold.
fn creativity_score(messages: &[&AnalyzedMessage]) -> f64 {
    let mut score = decayed_score(messages, |text| {
        let mut s = 0.0;
        if COMPARISON_MARKERS.iter().any(|m| text.contains(m)) {
            s += COMPARISON_WEIGHT;
        }
        if text.contains(';') || text.contains('—') || text.contains('(') {
            s += UNUSUAL_PUNCTUATION_WEIGHT;
        }
        s
    });

    score += UNIQUENESS_WEIGHT * lexical_diversity(messages);

    let lengths: Vec<usize> = messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .collect();
    if let (Some(min), Some(max)) = (lengths.iter().min(), lengths.iter().max()) {
        if *max > 0 && (*max as f64 / (*min).max(1) as f64) > 3.0 {
            score += LENGTH_VARIETY_WEIGHT;
        }
    }
    score.clamp(0.0, 1.0)
}

/// Type-token ratio over the whole sample.
fn lexical_diversity(messages: &[&AnalyzedMessage]) -> f64 {
    let mut total = 0usize;
    let mut unique = std::collections::HashSet::new();
    for message in messages {
        for word in message.content.to_lowercase().split_whitespace() {
            total += 1;
            unique.insert(word.to_string());
        }
    }
    if total == 0 {
        0.0
    } else {
        unique.len() as f64 / total as f64
    }
}

/// Confidence grows with sample size and lexical diversity.
fn confidence(messages: &[&AnalyzedMessage]) -> f64 {
    let size_factor = (messages.len() as f64 / 30.0).min(1.0);
    let diversity = lexical_diversity(messages);
    (0.3 + 0.5 * size_factor + 0.2 * diversity).min(1.0)
}
