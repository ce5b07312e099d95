//! Logging utilities
//!
//! Provides logging setup and configuration.

use env_logger;

/// Setup logging for an embedding application
///
/// The level is taken from `RUST_LOG` as usual for `env_logger`.
pub fn setup_logging() {
    env_logger::init();
}

/// Logging for tests; safe to call from every test
pub fn setup_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
