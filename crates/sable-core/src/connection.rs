//! Connection descriptors
//!
//! A `Connection` is the value object the forwarding engine moves
//! around: an address pair, the family derived from the remote address,
//! a weak back-reference to the cache peer the address belongs to, and
//! the kernel socket once one is open. Descriptors outlive sockets (a
//! candidate path is a descriptor with no socket yet) and may outlive
//! their peer record (reconfiguration drops peers independently).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::warn;

use crate::peer::CachePeer;

/// Protocol family of a candidate path, derived from its remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddressFamily {
    /// The family of the given address.
    #[must_use]
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::V4
        } else {
            Self::V6
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "v4"),
            Self::V6 => write!(f, "v6"),
        }
    }
}

/// What the TLS layer learned while negotiating on this connection.
#[derive(Debug, Clone, Default)]
pub struct NegotiationHistory {
    /// Negotiated protocol version, when the handshake got that far
    pub protocol: Option<String>,

    /// Negotiated cipher suite
    pub cipher: Option<String>,

    /// Whether a ServerHello was parsed on this connection
    pub server_hello_seen: bool,
}

/// One local/remote address pair and, once opened, its socket.
#[derive(Debug)]
pub struct Connection {
    local: SocketAddr,
    remote: SocketAddr,
    peer: Weak<CachePeer>,
    socket: Option<TcpStream>,
    start_time: Instant,
    tls_history: Option<Box<NegotiationHistory>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Create a closed descriptor with unspecified addresses.
    #[must_use]
    pub fn new() -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Self {
            local: unspecified,
            remote: unspecified,
            peer: Weak::new(),
            socket: None,
            start_time: Instant::now(),
            tls_history: None,
        }
    }

    /// Set the local/remote address pair.
    pub fn set_addrs(&mut self, local: SocketAddr, remote: SocketAddr) {
        self.local = local;
        self.remote = remote;
    }

    /// Local address.
    #[must_use]
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Remote address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Protocol family of the remote address.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.remote)
    }

    /// Bind this descriptor to a cache peer, or to none (direct origin).
    pub fn set_peer(&mut self, peer: Option<&Arc<CachePeer>>) {
        self.peer = peer.map_or_else(Weak::new, Arc::downgrade);
    }

    /// The peer this path leads to, unless the record was dropped.
    #[must_use]
    pub fn peer(&self) -> Option<Arc<CachePeer>> {
        self.peer.upgrade()
    }

    /// Whether both descriptors lead to the same peer.
    ///
    /// Identity is the peer record allocation; two descriptors with no
    /// peer at all belong to the same (direct origin) group.
    #[must_use]
    pub fn same_peer_as(&self, other: &Connection) -> bool {
        Weak::ptr_eq(&self.peer, &other.peer)
    }

    /// Whether a socket is open on this descriptor.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// The open socket, if any.
    #[must_use]
    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    /// Install a freshly opened socket and account it to the peer.
    pub fn adopt_socket(&mut self, socket: TcpStream) {
        debug_assert!(self.socket.is_none(), "socket adopted twice");
        self.socket = Some(socket);
        self.start_time = Instant::now();
        if let Some(peer) = self.peer.upgrade() {
            peer.note_connection_opened();
        }
    }

    /// Close the socket, if open, and notify the peer exactly once.
    ///
    /// Closing a descriptor that never opened is a no-op.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            drop(socket);
            if let Some(peer) = self.peer.upgrade() {
                peer.note_connection_closed();
            }
        }
    }

    /// Clone everything except the socket, which resets to closed.
    #[must_use]
    pub fn copy_details(&self) -> Connection {
        Connection {
            local: self.local,
            remote: self.remote,
            peer: self.peer.clone(),
            socket: None,
            start_time: self.start_time,
            tls_history: self.tls_history.clone(),
        }
    }

    /// Time since the socket was opened (or the descriptor created).
    #[must_use]
    pub fn age(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// How long this connection may still be used.
    ///
    /// The minimum of the caller's idle timeout and what remains of the
    /// persistent-connection lifetime cap. With the cap disabled, the
    /// idle timeout passes through unchanged; a connection past its cap
    /// still gets one second to finish.
    #[must_use]
    pub fn time_left(&self, idle_timeout: Duration, pconn_lifetime: Option<Duration>) -> Duration {
        let Some(cap) = pconn_lifetime else {
            return idle_timeout;
        };
        let age = self.age();
        let lifetime_left = if age < cap {
            cap - age
        } else {
            Duration::from_secs(1)
        };
        lifetime_left.min(idle_timeout)
    }

    /// TLS negotiation history, allocated on first use.
    pub fn tls_negotiations(&mut self) -> &mut NegotiationHistory {
        self.tls_history.get_or_insert_with(Default::default).as_mut()
    }

    /// TLS negotiation history, if any negotiation touched this
    /// connection.
    #[must_use]
    pub fn tls_history(&self) -> Option<&NegotiationHistory> {
        self.tls_history.as_deref()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(remote = %self.remote, "orphan connection closed at destruction");
            self.close();
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.local, self.remote)?;
        if let Some(peer) = self.peer() {
            write!(f, " via {peer}")?;
        }
        Ok(())
    }
}
