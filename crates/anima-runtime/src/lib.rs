//! The actor runtime: registration, bounded mailboxes, lifecycle, send with
//! retry and a per-recipient circuit breaker, broadcast, and a dead-letter
//! queue for messages that could not be delivered.
//!
//! Guarantees: FIFO per mailbox, one in-flight handler invocation per actor,
//! at-least-once delivery with the DLQ as the quarantine of last resort.
//! There is no ordering across actors.

pub mod actor;
pub mod breaker;
pub mod error;
pub mod system;

pub use actor::{Actor, ActorContext};
pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{Result, RuntimeError};
pub use system::{ActorSystem, DeadLetter, DlqMetrics, SystemHandle};
