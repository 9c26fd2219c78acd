pub mod actor;
pub mod db;
pub mod scoring;
pub mod store;
pub mod types;

pub use actor::LtmActor;
pub use scoring::{importance_score, novelty_score, semantic_tags, NoveltyScore};
pub use store::LtmStore;
pub use types::{LtmMemory, MemoryType, TriggerReason, UserProfile};
