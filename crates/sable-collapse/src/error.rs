//! Error types for the transient index.

use thiserror::Error;

/// Why a transient-index operation did not take effect.
///
/// None of these are fatal: a collision is the normal signal that
/// another worker owns the fetch, and a disabled index simply means the
/// caller proceeds without collapsing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CollapseError {
    /// Collapsed forwarding is disabled; every operation no-ops
    #[error("collapsed forwarding is disabled")]
    Disabled,

    /// Another worker already owns the in-flight fetch for this key, or
    /// no shared slot is free
    #[error("transient slot unavailable for this key")]
    Collision,

    /// The request does not fit the shared extras region
    #[error("request too large for a shared transient slot")]
    Oversized,
}
