use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use anima_core::config::PersonalityConfig;

use crate::traits::BaseTrait;

/// Lower bound of a resonance coefficient.
pub const RESONANCE_MIN: f64 = 0.7;
/// Upper bound of a resonance coefficient.
pub const RESONANCE_MAX: f64 = 1.3;

/// Per-user multiplicative modifier over the base traits: slowly learned,
/// bounded, and recoverable toward neutral during inactivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceProfile {
    pub user_id: String,
    /// trait name → coefficient in `[RESONANCE_MIN, RESONANCE_MAX]`.
    pub coefficients: BTreeMap<String, f64>,
    pub interaction_count: u64,
    pub last_adaptation: Option<DateTime<Utc>>,
    pub last_interaction: DateTime<Utc>,
}

impl ResonanceProfile {
    pub fn new(user_id: &str, traits: &[BaseTrait]) -> Self {
        Self {
            user_id: user_id.to_string(),
            coefficients: traits.iter().map(|t| (t.name.to_string(), 1.0)).collect(),
            interaction_count: 0,
            last_adaptation: None,
            last_interaction: Utc::now(),
        }
    }

    pub fn coefficient(&self, trait_name: &str) -> f64 {
        self.coefficients.get(trait_name).copied().unwrap_or(1.0)
    }

    pub fn days_inactive(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_interaction).num_days()
    }

    /// Nudge coefficients toward the observed preferences.
    ///
    /// `targets` carries desired coefficients per trait (modifiers clamped
    /// into the resonance band). Core traits use a reduced learning rate.
    /// After the nudge: clamp, scale the total deviation back under the
    /// budget, and add a little bounded noise so the system never settles
    /// into a fixed point.
    pub fn adapt(
        &mut self,
        targets: &BTreeMap<String, f64>,
        traits: &[BaseTrait],
        config: &PersonalityConfig,
    ) {
        for base in traits {
            let Some(target) = targets.get(base.name) else {
                continue;
            };
            let target = target.clamp(RESONANCE_MIN, RESONANCE_MAX);
            let rate = if base.is_core {
                config.learning_rate * config.core_learning_factor
            } else {
                config.learning_rate
            };
            let entry = self.coefficients.entry(base.name.to_string()).or_insert(1.0);
            *entry += rate * (target - *entry);
        }

        for value in self.coefficients.values_mut() {
            *value = value.clamp(RESONANCE_MIN, RESONANCE_MAX);
        }

        // Deviation budget: shrink every deviation proportionally when the
        // profile as a whole drifted too far from neutral.
        let total_deviation: f64 = self.coefficients.values().map(|c| (c - 1.0).abs()).sum();
        if total_deviation > config.max_deviation {
            let scale = config.max_deviation / total_deviation;
            for value in self.coefficients.values_mut() {
                *value = 1.0 + (*value - 1.0) * scale;
            }
            debug!(user_id = %self.user_id, total_deviation, "resonance deviation rescaled");
        }

        for value in self.coefficients.values_mut() {
            *value = (*value + config.noise_level * pseudo_noise())
                .clamp(RESONANCE_MIN, RESONANCE_MAX);
        }

        self.last_adaptation = Some(Utc::now());
    }

    /// Inactivity recovery: past `recovery_days`, every further inactive
    /// day interpolates each coefficient toward neutral by `recovery_rate`.
    pub fn recover(&mut self, now: DateTime<Utc>, config: &PersonalityConfig) -> bool {
        let days_over = self.days_inactive(now) - config.recovery_days;
        if days_over < 0 {
            return false;
        }
        let retain = (1.0 - config.recovery_rate).powi(days_over as i32 + 1);
        let mut changed = false;
        for value in self.coefficients.values_mut() {
            let recovered = 1.0 + (*value - 1.0) * retain;
            if (recovered - *value).abs() > f64::EPSILON {
                changed = true;
            }
            *value = if (recovered - 1.0).abs() < 1e-3 {
                1.0
            } else {
                recovered
            };
        }
        changed
    }

    pub fn touch(&mut self) {
        self.last_interaction = Utc::now();
    }
}

/// Deterministic pseudo-noise in `[-1, 1]` from the wall clock's subsecond
/// nanos.
fn pseudo_noise() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 2001) as f64 / 1000.0 - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::base_traits;
    use chrono::Duration;

    fn config() -> PersonalityConfig {
        PersonalityConfig {
            learning_rate: 0.1,
            core_learning_factor: 0.5,
            max_deviation: 2.0,
            noise_level: 0.0,
            recovery_days: 14,
            recovery_rate: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn coefficients_stay_in_bounds_after_adaptation() {
        let traits = base_traits();
        let mut profile = ResonanceProfile::new("u1", &traits);
        let targets: BTreeMap<String, f64> =
            traits.iter().map(|t| (t.name.to_string(), 5.0)).collect();
        for _ in 0..200 {
            profile.adapt(&targets, &traits, &config());
        }
        for value in profile.coefficients.values() {
            assert!((RESONANCE_MIN..=RESONANCE_MAX).contains(value), "value {value}");
        }
    }

    #[test]
    fn core_traits_drift_slower() {
        let traits = base_traits();
        let mut profile = ResonanceProfile::new("u1", &traits);
        let targets: BTreeMap<String, f64> = [
            ("empathy".to_string(), 1.3),
            ("irony".to_string(), 1.3),
        ]
        .into();
        profile.adapt(&targets, &traits, &config());
        let core_shift = (profile.coefficient("empathy") - 1.0).abs();
        let regular_shift = (profile.coefficient("irony") - 1.0).abs();
        assert!(core_shift < regular_shift);
    }

    #[test]
    fn deviation_budget_rescales() {
        let traits = base_traits();
        let mut profile = ResonanceProfile::new("u1", &traits);
        for value in profile.coefficients.values_mut() {
            *value = 1.3;
        }
        let tight = PersonalityConfig {
            max_deviation: 0.8,
            noise_level: 0.0,
            ..config()
        };
        profile.adapt(&BTreeMap::new(), &traits, &tight);
        let total: f64 = profile.coefficients.values().map(|c| (c - 1.0).abs()).sum();
        assert!(total <= 0.8 + 1e-9);
    }

    #[test]
    fn recovery_pulls_toward_neutral() {
        let traits = base_traits();
        let mut profile = ResonanceProfile::new("u1", &traits);
        profile.coefficients.insert("irony".into(), 1.3);
        profile.last_interaction = Utc::now() - Duration::days(20);

        let changed = profile.recover(Utc::now(), &config());
        assert!(changed);
        let c = profile.coefficient("irony");
        assert!(c < 1.3 && c >= 1.0);

        // Long enough inactivity fully neutralizes.
        profile.last_interaction = Utc::now() - Duration::days(120);
        profile.recover(Utc::now(), &config());
        assert_eq!(profile.coefficient("irony"), 1.0);
    }

    #[test]
    fn recovery_is_a_no_op_before_threshold() {
        let traits = base_traits();
        let mut profile = ResonanceProfile::new("u1", &traits);
        profile.coefficients.insert("irony".into(), 1.2);
        profile.last_interaction = Utc::now() - Duration::days(3);
        assert!(!profile.recover(Utc::now(), &config()));
        assert_eq!(profile.coefficient("irony"), 1.2);
    }
}
