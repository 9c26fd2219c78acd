use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a user, as handed to us by the chat front-end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stream id grouping this user's session events.
    pub fn session_stream(&self) -> String {
        format!("user_{}", self.0)
    }

    /// Stream id grouping this user's long-term-memory events.
    pub fn ltm_stream(&self) -> String {
        format!("ltm_{}", self.0)
    }

    /// Stream id grouping this user's generation events.
    pub fn generation_stream(&self) -> String {
        format!("generation_{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Chat identifier from the front-end transport (numeric on most platforms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates the fan-out replies of a single user turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response generation mode. Determines prompt composition and sampling
/// parameters downstream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    #[default]
    Talk,
    Expert,
    Creative,
    Base,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMode::Talk => "talk",
            GenerationMode::Expert => "expert",
            GenerationMode::Creative => "creative",
            GenerationMode::Base => "base",
        }
    }

    /// The modes the text scorer competes over. `Base` is never detected,
    /// only assigned explicitly.
    pub fn detectable() -> [GenerationMode; 3] {
        [
            GenerationMode::Talk,
            GenerationMode::Expert,
            GenerationMode::Creative,
        ]
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GenerationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "talk" => Ok(GenerationMode::Talk),
            "expert" => Ok(GenerationMode::Expert),
            "creative" => Ok(GenerationMode::Creative),
            "base" => Ok(GenerationMode::Base),
            other => Err(format!("unknown generation mode: {}", other)),
        }
    }
}

/// Learned summary of how a user writes, each component in `[0, 1]`.
///
/// Kept as a dense struct in hot paths; serialized with its field names for
/// persistence and logging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StyleVector {
    pub playfulness: f64,
    pub seriousness: f64,
    pub emotionality: f64,
    pub creativity: f64,
}

/// Neutral midpoint for every style component.
pub const STYLE_NEUTRAL: f64 = 0.5;

impl StyleVector {
    pub fn neutral() -> Self {
        Self {
            playfulness: STYLE_NEUTRAL,
            seriousness: STYLE_NEUTRAL,
            emotionality: STYLE_NEUTRAL,
            creativity: STYLE_NEUTRAL,
        }
    }

    pub fn components(&self) -> [f64; 4] {
        [
            self.playfulness,
            self.seriousness,
            self.emotionality,
            self.creativity,
        ]
    }

    /// Largest absolute per-component difference. Drives partner-persona
    /// versioning: a new version is written only when this exceeds the
    /// configured change threshold.
    pub fn max_component_delta(&self, other: &StyleVector) -> f64 {
        self.components()
            .iter()
            .zip(other.components().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    pub fn clamped(self) -> Self {
        Self {
            playfulness: self.playfulness.clamp(0.0, 1.0),
            seriousness: self.seriousness.clamp(0.0, 1.0),
            emotionality: self.emotionality.clamp(0.0, 1.0),
            creativity: self.creativity.clamp(0.0, 1.0),
        }
    }
}

impl Default for StyleVector {
    fn default() -> Self {
        Self::neutral()
    }
}
