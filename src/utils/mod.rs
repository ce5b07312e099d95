//! Utility functions
//!
//! Provides logging setup and URL manipulation helpers.

pub mod logging;
pub mod url;
