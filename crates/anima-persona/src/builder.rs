use anima_core::types::{GenerationMode, StyleVector};

/// Minimum confidence a persona recommendation is ever reported with.
const MIN_CONFIDENCE: f64 = 0.3;

/// Map a style vector to the dialogue mode that suits it, with a
/// confidence proportional to how clearly that mode wins.
///
/// Playful/emotional writers get `talk`, structured writers get `expert`,
/// imaginative writers get `creative`. The style confidence scales the
/// final mode confidence so a thin sample never produces a strong
/// recommendation.
pub fn recommend_mode(style: &StyleVector, style_confidence: f64) -> (GenerationMode, f64) {
    let talk = 0.6 * style.playfulness + 0.4 * style.emotionality;
    let expert = style.seriousness;
    let creative = style.creativity;

    let (mode, best, runner_up) = if talk >= expert && talk >= creative {
        (GenerationMode::Talk, talk, expert.max(creative))
    } else if expert >= creative {
        (GenerationMode::Expert, expert, talk.max(creative))
    } else {
        (GenerationMode::Creative, creative, talk.max(expert))
    };

    // Margin over the runner-up: 0 margin → barely better than the
    // alternative, 0.5+ → decisive.
    let margin = ((best - runner_up) * 2.0).clamp(0.0, 1.0);
    let confidence = (MIN_CONFIDENCE + 0.7 * margin) * style_confidence.clamp(0.0, 1.0);
    (mode, confidence.clamp(0.0, 1.0))
}
