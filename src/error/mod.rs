//! Error handling
//!
//! Defines error types and the mapping of transport failures onto the shared
//! status taxonomy.

pub mod handlers;
pub mod types;

pub use types::*;
