/// One row of the base trait table. Core traits are identity-bearing:
/// their active value is floored and their resonance drifts slower.
#[derive(Debug, Clone)]
pub struct BaseTrait {
    pub name: &'static str,
    pub base_value: f64,
    pub is_core: bool,
}

/// The agent's base personality. Values are the design-time defaults; the
/// durable `personality_base_traits` table is seeded from this on first
/// start and wins afterwards.
pub fn base_traits() -> Vec<BaseTrait> {
    vec![
        BaseTrait { name: "empathy", base_value: 0.8, is_core: true },
        BaseTrait { name: "curiosity", base_value: 0.8, is_core: true },
        BaseTrait { name: "caring", base_value: 0.75, is_core: true },
        BaseTrait { name: "creativity", base_value: 0.7, is_core: false },
        BaseTrait { name: "philosophical", base_value: 0.65, is_core: false },
        BaseTrait { name: "irony", base_value: 0.6, is_core: false },
        BaseTrait { name: "playfulness", base_value: 0.6, is_core: false },
        BaseTrait { name: "assertiveness", base_value: 0.5, is_core: false },
    ]
}

/// Which traits an emotion modifier speaks to. Style modifiers address
/// traits by name; emotion modifiers arrive keyed by emotion label and are
/// routed through this table.
pub fn emotion_trait_affinity(emotion: &str) -> &'static [&'static str] {
    match emotion {
        "joy" | "amusement" => &["playfulness", "irony"],
        "excitement" | "surprise" => &["curiosity", "creativity"],
        "curiosity" => &["curiosity"],
        "caring" | "love" | "gratitude" => &["empathy", "caring"],
        "sadness" | "grief" | "disappointment" => &["empathy"],
        "realization" => &["philosophical"],
        "optimism" | "pride" => &["assertiveness"],
        "anger" | "annoyance" | "disapproval" => &["assertiveness", "irony"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_traits_are_marked() {
        let traits = base_traits();
        let core: Vec<&str> = traits.iter().filter(|t| t.is_core).map(|t| t.name).collect();
        assert_eq!(core, vec!["empathy", "curiosity", "caring"]);
        assert!(traits.iter().all(|t| (0.0..=1.0).contains(&t.base_value)));
    }

    #[test]
    fn affinity_routes_emotions_to_traits() {
        assert!(emotion_trait_affinity("caring").contains(&"empathy"));
        assert!(emotion_trait_affinity("neutral").is_empty());
    }
}
