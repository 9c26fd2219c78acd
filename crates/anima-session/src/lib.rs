//! The session orchestrator: owns per-user sessions, gates each turn
//! through the rate limiter, fans out to short- and long-term memory,
//! partner model, personality, and emotion analysis, correlates the
//! replies by request id, detects the generation mode, and dispatches the
//! final generation request.

pub mod actor;
pub mod analysis;
pub mod error;
pub mod mode;
pub mod pending;
pub mod perception;
pub mod session;

pub use actor::SessionActor;
pub use error::{Result, SessionError};
pub use mode::{ModeDetector, ModeLexicon};
pub use pending::{PendingRequest, Readiness};
pub use perception::PerceptionActor;
pub use session::Session;
