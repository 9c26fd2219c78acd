use chrono::{DateTime, Timelike, Utc};
use std::collections::BTreeMap;

use crate::resonance::ResonanceProfile;
use crate::traits::BaseTrait;

/// Core traits are floored at this fraction of their base value.
pub const CORE_FLOOR_FACTOR: f64 = 0.4;
/// Per-session change cap as a fraction of the base value.
pub const SESSION_CHANGE_FACTOR: f64 = 0.2;

/// Computed active trait values plus which protections engaged.
#[derive(Debug, Clone)]
pub struct ActiveProfile {
    pub traits: BTreeMap<String, f64>,
    /// Protections that actually clamped a value in this computation.
    pub engaged: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileMetrics {
    pub stability: f64,
    pub dominance: f64,
    pub balance: f64,
}

/// Wall-clock modifier: the agent is a little dimmer at night, a little
/// brighter during the day.
pub fn temporal_modifier(now: DateTime<Utc>) -> f64 {
    match now.hour() {
        6..=11 => 0.9,
        12..=17 => 1.0,
        18..=22 => 0.95,
        _ => 0.85,
    }
}

/// Compute the active profile:
/// `clamp(base × resonance × style_mod × emotion_mod × temporal_mod, 0, 1)`
/// then apply protections in order: core floor first, then session change
/// limits.
pub fn compute_profile(
    traits: &[BaseTrait],
    resonance: &ResonanceProfile,
    style_mods: &BTreeMap<String, f64>,
    emotion_mods: &BTreeMap<String, f64>,
    session_start: Option<&BTreeMap<String, f64>>,
    now: DateTime<Utc>,
) -> ActiveProfile {
    let temporal = temporal_modifier(now);
    let mut values = BTreeMap::new();
    let mut engaged = Vec::new();
    let mut core_hit = false;
    let mut session_hit = false;

    for base in traits {
        let style = modifier_for(style_mods, base.name);
        let emotion = modifier_for(emotion_mods, base.name);
        let raw = base.base_value * resonance.coefficient(base.name) * style * emotion * temporal;
        let mut value = raw.clamp(0.0, 1.0);

        if base.is_core {
            let floor = CORE_FLOOR_FACTOR * base.base_value;
            if value < floor {
                value = floor;
                core_hit = true;
            }
        }

        if let Some(start) = session_start.and_then(|s| s.get(base.name)) {
            let cap = SESSION_CHANGE_FACTOR * base.base_value;
            if (value - start).abs() > cap {
                value = if value > *start { start + cap } else { start - cap };
                session_hit = true;
            }
        }

        values.insert(base.name.to_string(), value.clamp(0.0, 1.0));
    }

    if core_hit {
        engaged.push("core_constraints");
    }
    if session_hit {
        engaged.push("session_limits");
    }

    ActiveProfile {
        traits: values,
        engaged,
    }
}

fn modifier_for(mods: &BTreeMap<String, f64>, trait_name: &str) -> f64 {
    mods.get(trait_name)
        .copied()
        .unwrap_or(1.0)
        .clamp(0.5, 1.5)
}

/// Top-`n` traits by active value, strongest first.
pub fn dominant_traits(profile: &BTreeMap<String, f64>, n: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, f64)> = profile.iter().map(|(k, v)| (k, *v)).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.into_iter().take(n).map(|(k, _)| k.clone()).collect()
}

/// Profile shape metrics, each in `[0, 1]` and rounded to 3 decimals:
/// stability (inverse of spread), dominance (top-3 gap over the rest),
/// balance (normalized Shannon entropy).
pub fn profile_metrics(profile: &BTreeMap<String, f64>) -> ProfileMetrics {
    let values: Vec<f64> = profile.values().copied().collect();
    if values.is_empty() {
        return ProfileMetrics {
            stability: 0.5,
            dominance: 0.5,
            balance: 0.5,
        };
    }

    let stability = if values.len() > 1 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        1.0 - (variance.sqrt() * 2.0).min(1.0)
    } else {
        1.0
    };

    let mut sorted = values.clone();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let dominance = if sorted.len() >= 3 {
        let top3 = sorted[..3].iter().sum::<f64>() / 3.0;
        let rest = &sorted[3..];
        let rest_avg = if rest.is_empty() {
            0.0
        } else {
            rest.iter().sum::<f64>() / rest.len() as f64
        };
        ((top3 - rest_avg) * 2.0).min(1.0).max(0.0)
    } else {
        0.5
    };

    let balance = if values.len() > 1 {
        let total: f64 = values.iter().sum();
        if total > 0.0 {
            let entropy: f64 = values
                .iter()
                .map(|v| v / total)
                .filter(|p| *p > 0.0)
                .map(|p| -p * p.ln())
                .sum();
            entropy / (values.len() as f64).ln()
        } else {
            0.5
        }
    } else {
        0.5
    };

    ProfileMetrics {
        stability: round3(stability),
        dominance: round3(dominance),
        balance: round3(balance),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
