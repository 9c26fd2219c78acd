//! Partner persona: a learned per-user summary of how the interlocutor
//! writes and which dialogue mode suits them, plus the batch analyzers that
//! feed it (style vector extraction and trait manifestation detection).

pub mod actor;
pub mod builder;
pub mod db;
pub mod detector;
pub mod error;
pub mod store;
pub mod style;

pub use actor::PartnerModelActor;
pub use builder::recommend_mode;
pub use detector::{TraitDetector, TraitManifestation};
pub use error::{PersonaError, Result};
pub use store::{PartnerPersona, PersonaStore};
pub use style::{analyze_style, AnalyzedMessage, StyleAnalysis};
