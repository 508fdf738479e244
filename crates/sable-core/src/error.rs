//! Error types for the core building blocks.

use thiserror::Error;

/// Configuration errors detected before the forwarding engine starts.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `forward_max_tries` must be a positive number of attempts
    #[error("forward_max_tries must be greater than zero")]
    InvalidForwardMaxTries,
}
