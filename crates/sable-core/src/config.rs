//! Forwarding configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the forwarding engine and its candidate paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Upper bound on forwarding attempts per request; also the capacity
    /// hint for newly created path books
    #[serde(default = "default_forward_max_tries")]
    pub forward_max_tries: usize,

    /// Cap on the total lifetime of a persistent connection; `None`
    /// disables the cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pconn_lifetime: Option<Duration>,

    /// Global read timeout applied to upstream I/O waits
    #[serde(default = "default_read_timeout")]
    pub read_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            forward_max_tries: default_forward_max_tries(),
            pconn_lifetime: None,
            read_timeout: default_read_timeout(),
        }
    }
}

impl ForwardConfig {
    /// Reject configurations the forwarding engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forward_max_tries == 0 {
            return Err(ConfigError::InvalidForwardMaxTries);
        }
        Ok(())
    }
}

/// Configuration for collapsed forwarding (cross-worker miss sharing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollapseConfig {
    /// Whether duplicate concurrent misses collapse onto one fetch
    #[serde(default)]
    pub collapsed_forwarding: bool,

    /// Entry limit of the shared transient table, fixed at creation
    #[serde(default = "default_shared_entries_limit")]
    pub shared_entries_limit: usize,
}

impl Default for CollapseConfig {
    fn default() -> Self {
        Self {
            collapsed_forwarding: false,
            shared_entries_limit: default_shared_entries_limit(),
        }
    }
}

fn default_forward_max_tries() -> usize {
    25
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_shared_entries_limit() -> usize {
    16384
}
