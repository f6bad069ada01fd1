//! vidrelay-common: shared error taxonomy, session identifiers, and
//! configuration types used by every vidrelay crate.

pub mod config;
pub mod error;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::SessionId;
