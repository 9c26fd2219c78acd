pub mod actor;
pub mod db;
pub mod store;

pub use actor::StmActor;
pub use store::{ContextFormat, MemoryContext, SpeakerRole, StmStore};
