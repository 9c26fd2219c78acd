use serde_json::{json, Value};
use tracing::debug;

use anima_core::emotion::EmotionVector;
use anima_core::types::GenerationMode;
use anima_persona::{analyze_style, recommend_mode, AnalyzedMessage, TraitDetector};

/// Outcome of one personality-analysis run over recent history.
#[derive(Debug)]
pub struct AnalysisOutcome {
    /// Payload for `UpdatePartnerModel`.
    pub partner_update: Value,
    /// Payload for `UpdatePersonalityContext` (style modifiers), present
    /// only when the style pass had enough material.
    pub style_update: Option<Value>,
}

/// Convert an STM context response (either format) into analyzer input.
pub fn messages_from_context(messages: &[Value]) -> Vec<AnalyzedMessage> {
    messages
        .iter()
        .filter_map(|entry| {
            let content = entry.get("content")?.as_str()?.to_string();
            let from_user = match entry.get("role").and_then(Value::as_str) {
                Some(role) => role == "user",
                None => entry.get("type").and_then(Value::as_str) == Some("user"),
            };
            Some(AnalyzedMessage { content, from_user })
        })
        .collect()
}

/// Run the style analyzer, trait detector, and persona builder over recent
/// history. Pure: the caller owns delivery of the resulting updates.
pub fn run_personality_analysis(
    user_id: &str,
    messages: &[AnalyzedMessage],
    current_mode: GenerationMode,
    last_emotions: Option<&EmotionVector>,
) -> AnalysisOutcome {
    let style = analyze_style(messages);
    let (mode, mode_confidence) = recommend_mode(&style.vector, style.confidence);
    let traits = TraitDetector::detect(messages, Some(current_mode), last_emotions);

    debug!(
        user_id,
        analyzed = style.messages_analyzed,
        mode = mode.as_str(),
        traits = traits.len(),
        "personality analysis complete"
    );

    let detected: Vec<Value> = traits
        .iter()
        .map(|t| {
            json!({
                "trait_name": t.trait_name,
                "strength": t.strength,
                "markers": t.markers,
            })
        })
        .collect();

    let partner_update = json!({
        "user_id": user_id,
        "style_vector": style.vector,
        "recommended_mode": mode.as_str(),
        "mode_confidence": mode_confidence,
        "style_confidence": style.confidence,
        "messages_analyzed": style.messages_analyzed,
        "detected_traits": detected,
    });

    // Style modifiers for the personality core: component value shifted
    // into the [0.5, 1.5] modifier band.
    let style_update = (style.messages_analyzed > 0).then(|| {
        json!({
            "user_id": user_id,
            "modifier_type": "style",
            "modifier_data": {
                "playfulness": 0.5 + style.vector.playfulness,
                "creativity": 0.5 + style.vector.creativity,
                "irony": 0.5 + style.vector.playfulness * 0.5 + style.vector.creativity * 0.5,
                "philosophical": 0.5 + style.vector.seriousness,
            },
        })
    });

    AnalysisOutcome {
        partner_update,
        style_update,
    }
}
