//! The personality core: base traits, per-user multiplicative resonance
//! with bounded adaptation, protection constraints (core floors, session
//! change limits, inactivity recovery), and the actor serving profile
//! requests with a TTL cache.

pub mod actor;
pub mod db;
pub mod error;
pub mod profile;
pub mod resonance;
pub mod traits;

pub use actor::PersonalityActor;
pub use error::{PersonalityError, Result};
pub use profile::{compute_profile, profile_metrics, ActiveProfile, ProfileMetrics};
pub use resonance::ResonanceProfile;
pub use traits::{BaseTrait, base_traits};
