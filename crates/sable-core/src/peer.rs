//! Cache-peer records
//!
//! A `CachePeer` describes one configured upstream (a parent or sibling
//! proxy). Connection descriptors hold weak back-references to these
//! records, so a reconfiguration may drop a peer while descriptors that
//! point at it are still in flight.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// A configured upstream peer.
///
/// Peer identity is allocation identity: two connections lead to the
/// same peer iff they reference the same `CachePeer` record. Requests
/// going straight to an origin server carry no peer record at all.
#[derive(Debug)]
pub struct CachePeer {
    /// Name from the configuration, used in logs
    name: String,

    /// Host this peer resolves through
    host: String,

    /// Open connections currently accounted to this peer
    open_connections: AtomicU32,
}

impl CachePeer {
    /// Create a peer record.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            open_connections: AtomicU32::new(0),
        }
    }

    /// Configured peer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host the peer resolves through.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Number of connections currently open to this peer.
    #[must_use]
    pub fn open_connections(&self) -> u32 {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Account a newly opened connection.
    pub fn note_connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a closed connection.
    pub fn note_connection_closed(&self) {
        let previous = self.open_connections.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "peer {} lost an unopened connection", self.name);
    }
}

impl fmt::Display for CachePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_accounting() {
        let peer = CachePeer::new("cache1", "cache1.example.net");
        assert_eq!(peer.open_connections(), 0);

        peer.note_connection_opened();
        peer.note_connection_opened();
        assert_eq!(peer.open_connections(), 2);

        peer.note_connection_closed();
        assert_eq!(peer.open_connections(), 1);
    }

    #[test]
    fn test_display_uses_name() {
        let peer = CachePeer::new("sibling-a", "10.0.0.7");
        assert_eq!(peer.to_string(), "sibling-a");
    }
}
