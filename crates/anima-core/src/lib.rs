//! Shared vocabulary of the anima runtime: identifiers, generation modes,
//! emotion and style vectors, the actor message envelope, collaborator
//! traits, and the configuration surface.
//!
//! Every other crate in the workspace depends on this one; nothing here
//! depends on storage or on the actor system.

pub mod clients;
pub mod config;
pub mod emotion;
pub mod error;
pub mod message;
pub mod types;

pub use error::{CoreError, Result};
