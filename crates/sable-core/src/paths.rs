//! Candidate path book
//!
//! DNS and peer selection hand the forwarding engine an ordered list of
//! candidate paths: all addresses of the first peer grouped by family,
//! then the next peer, and so on. The book keeps that order, hands paths
//! out one at a time, and takes failed ones back for later retry.
//!
//! The engine races a "prime" family against a "spare" family within the
//! current peer group, so the book answers three kinds of questions:
//! the next path overall, the next prime for the peer being worked on,
//! and the next spare. Each answer also says whether giving up on the
//! category is final, which is only decidable once the book is finalized
//! or a path of another category proves there is somewhere else to go.

use std::fmt;

use tracing::{debug, trace};

use crate::connection::Connection;

/// One slot of the book. A vacant slot is a path that has been extracted
/// (tried) and not returned.
#[derive(Debug)]
struct PathSlot {
    connection: Option<Connection>,
}

/// A path handed out by [`PathBook::extract_front`] and friends.
///
/// Keeps the book position so a failed attempt can go back to exactly
/// the slot it came from.
#[derive(Debug)]
pub struct ExtractedPath {
    /// The candidate connection, ready to be opened
    pub connection: Connection,
    position: usize,
}

impl ExtractedPath {
    /// Book slot this path came from.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }
}

/// A find result: the matching slot, if any, plus whether the scan ran
/// into a path of another category ("other peer" or "other family")
/// instead. Finding an "other" means the caller has somewhere else to
/// go and need not wait for more paths.
#[derive(Debug, Clone, Copy)]
struct Finding {
    found: Option<usize>,
    found_other: bool,
}

impl Finding {
    const NOTHING: Self = Self {
        found: None,
        found_other: false,
    };

    const OTHER: Self = Self {
        found: None,
        found_other: true,
    };

    fn at(index: usize) -> Self {
        Self {
            found: Some(index),
            found_other: false,
        }
    }
}

/// Ordered, partially consumed set of resolved candidate paths.
pub struct PathBook {
    /// Slots in the order selection produced them (peer, then family)
    paths: Vec<PathSlot>,

    /// Length of the leading run of vacant slots; equivalently, the
    /// index of the first available path (or `paths.len()`)
    paths_to_skip: usize,

    /// Number of occupied (available) slots
    available_paths: usize,

    /// Latched once selection promises no further [`PathBook::add`]
    finalized: bool,

    /// Single-bit mailbox owned by the consumer: whether a
    /// candidates-changed notification is already scheduled
    pub notification_pending: bool,
}

impl PathBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            paths_to_skip: 0,
            available_paths: 0,
            finalized: false,
            notification_pending: false,
        }
    }

    /// Create an empty book sized for the configured attempt limit.
    #[must_use]
    pub fn with_capacity_hint(forward_max_tries: usize) -> Self {
        let mut book = Self::new();
        book.paths.reserve(forward_max_tries);
        book
    }

    /// Append a candidate path after all existing ones.
    pub fn add(&mut self, connection: Connection) {
        trace!(path = %connection, "adding candidate path");
        self.paths.push(PathSlot {
            connection: Some(connection),
        });
        self.available_paths += 1;
    }

    /// Whether the book has no available paths left.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.available_paths == 0
    }

    /// The number of available paths.
    #[must_use]
    pub fn size(&self) -> usize {
        self.available_paths
    }

    /// Whether selection has promised no further paths.
    #[must_use]
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Record that selection is exhausted; latches permanently.
    pub fn finalize(&mut self) {
        debug!(paths = self.paths.len(), "destinations finalized");
        self.finalized = true;
    }

    /// Extract the first available path.
    ///
    /// # Panics
    ///
    /// Panics when the book is empty; callers check [`PathBook::empty`]
    /// first.
    pub fn extract_front(&mut self) -> ExtractedPath {
        assert!(!self.empty(), "extracting from an empty path book");
        self.extract_found("first", self.start())
    }

    /// Extract the first available path matching `current_peer` on both
    /// peer and family, but only if it is the leftmost available path.
    ///
    /// Paths arrive grouped by peer and family, so any same-peer
    /// same-family path that is not leftmost would be preceded by
    /// another prime anyway; a mismatching leftmost path means the
    /// primes for `current_peer` are gone.
    pub fn extract_prime(&mut self, current_peer: &Connection) -> Option<ExtractedPath> {
        let found = self.find_prime(current_peer);
        let extracted = found
            .found
            .map(|index| self.extract_found("same-peer same-family match", index));
        if extracted.is_none() {
            trace!(peer = %current_peer, "no same-peer same-family paths");
        }
        extracted
    }

    /// Extract the first available path with the same peer as
    /// `current_peer` but the other family.
    pub fn extract_spare(&mut self, current_peer: &Connection) -> Option<ExtractedPath> {
        let found = self.find_spare(current_peer);
        let extracted = found
            .found
            .map(|index| self.extract_found("same-peer different-family match", index));
        if extracted.is_none() {
            trace!(peer = %current_peer, "no same-peer different-family paths");
        }
        extracted
    }

    /// Whether [`PathBook::extract_spare`] would return a path right
    /// now.
    #[must_use]
    pub fn have_spare(&self, current_peer: &Connection) -> bool {
        self.find_spare(current_peer).found.is_some()
    }

    /// Whether [`PathBook::extract_prime`] returns and will keep
    /// returning `None` for `current_peer`.
    #[must_use]
    pub fn done_with_primes(&self, current_peer: &Connection) -> bool {
        self.done_with(self.find_prime(current_peer))
    }

    /// Whether [`PathBook::extract_spare`] returns and will keep
    /// returning `None` for `current_peer`.
    #[must_use]
    pub fn done_with_spares(&self, current_peer: &Connection) -> bool {
        self.done_with(self.find_spare(current_peer))
    }

    /// Whether the book has nothing left for `current_peer` in either
    /// family, now or ever.
    #[must_use]
    pub fn done_with_peer(&self, current_peer: &Connection) -> bool {
        self.done_with(self.find_peer(current_peer))
    }

    /// Return a previously extracted path to its slot.
    ///
    /// # Panics
    ///
    /// Panics when the handle does not name a vacant slot of this book;
    /// returning a path twice (or to the wrong book) is a logic error.
    pub fn retry_path(&mut self, path: ExtractedPath) {
        let ExtractedPath {
            connection,
            position,
        } = path;
        debug!(path = %connection, position, "returning path for retry");

        assert!(position < self.paths.len(), "retrying an unknown path");
        let slot = &mut self.paths[position];
        assert!(
            slot.connection.is_none(),
            "retrying a path that was never extracted"
        );

        slot.connection = Some(connection);
        self.available_paths += 1;
        if position < self.paths_to_skip {
            self.paths_to_skip = position;
        }
    }

    /// Index of the first available slot (or `paths.len()`).
    fn start(&self) -> usize {
        debug_assert!(self.paths_to_skip <= self.paths.len());
        self.paths_to_skip
    }

    /// The connection occupying `index`, if the slot is occupied.
    fn occupant(&self, index: usize) -> Option<&Connection> {
        self.paths.get(index).and_then(|slot| slot.connection.as_ref())
    }

    /// Leftmost-available check: a prime for `current_peer` exists iff
    /// the first available path matches on peer and family.
    fn find_prime(&self, current_peer: &Connection) -> Finding {
        match self.occupant(self.start()) {
            None => Finding::NOTHING,
            Some(first) => {
                if first.same_peer_as(current_peer) && first.family() == current_peer.family() {
                    Finding::at(self.start())
                } else {
                    Finding::OTHER
                }
            }
        }
    }

    /// Scan for a same-peer different-family path. The scan stops at
    /// the first available path of another peer: same-peer paths are
    /// grouped, so nothing past that point can match.
    fn find_spare(&self, current_peer: &Connection) -> Finding {
        for index in self.start()..self.paths.len() {
            let Some(candidate) = self.occupant(index) else {
                continue;
            };
            if !candidate.same_peer_as(current_peer) {
                return Finding::OTHER;
            }
            if candidate.family() != current_peer.family() {
                return Finding::at(index);
            }
        }
        Finding::NOTHING
    }

    /// Leftmost-available check for any family of `current_peer`.
    fn find_peer(&self, current_peer: &Connection) -> Finding {
        match self.occupant(self.start()) {
            None => Finding::NOTHING,
            Some(first) => {
                if first.same_peer_as(current_peer) {
                    Finding::at(self.start())
                } else {
                    Finding::OTHER
                }
            }
        }
    }

    /// A category is done when nothing matches and either no more paths
    /// will ever arrive or an "other" path showed the caller where to
    /// go instead.
    fn done_with(&self, finding: Finding) -> bool {
        if finding.found.is_some() {
            return false;
        }
        self.finalized || finding.found_other
    }

    /// Vacate the slot at `index` and hand its connection out.
    fn extract_found(&mut self, description: &str, index: usize) -> ExtractedPath {
        let slot = &mut self.paths[index];
        let Some(connection) = slot.connection.take() else {
            unreachable!("extracting a vacant path slot")
        };
        self.available_paths -= 1;

        // extracting the leftmost available path moves the vacant prefix
        if index == self.paths_to_skip {
            self.paths_to_skip += 1;
            while self.paths_to_skip < self.paths.len()
                && self.paths[self.paths_to_skip].connection.is_none()
            {
                self.paths_to_skip += 1;
            }
        }

        trace!(path = %connection, index, "{description}");
        ExtractedPath {
            connection,
            position: index,
        }
    }
}

impl Default for PathBook {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PathBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty() {
            return write!(f, "[no paths]");
        }
        write!(
            f,
            "{}{} paths",
            self.size(),
            if self.finalized { "" } else { "+" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AddressFamily;
    use crate::peer::CachePeer;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn path(remote: &str, peer: Option<&Arc<CachePeer>>) -> Connection {
        let remote: SocketAddr = remote.parse().unwrap();
        let local = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let mut conn = Connection::new();
        conn.set_addrs(local, remote);
        conn.set_peer(peer);
        conn
    }

    /// Book from scenario tests: peerA v4, peerA v6, peerB v4.
    fn two_peer_book() -> (PathBook, Arc<CachePeer>, Arc<CachePeer>) {
        let peer_a = Arc::new(CachePeer::new("peerA", "a.example.net"));
        let peer_b = Arc::new(CachePeer::new("peerB", "b.example.net"));

        let mut book = PathBook::new();
        book.add(path("192.0.2.1:3128", Some(&peer_a)));
        book.add(path("[2001:db8::1]:3128", Some(&peer_a)));
        book.add(path("192.0.2.2:3128", Some(&peer_b)));
        book.finalize();
        (book, peer_a, peer_b)
    }

    fn check_invariants(book: &PathBook) {
        let occupied = book
            .paths
            .iter()
            .filter(|slot| slot.connection.is_some())
            .count();
        assert_eq!(book.size(), occupied);
        assert!(book.paths_to_skip <= book.paths.len());
        for slot in &book.paths[..book.paths_to_skip] {
            assert!(slot.connection.is_none());
        }
    }

    #[test]
    fn test_empty_book() {
        let book = PathBook::new();
        assert!(book.empty());
        assert_eq!(book.size(), 0);
        assert_eq!(book.to_string(), "[no paths]");
    }

    #[test]
    fn test_add_keeps_order_and_count() {
        let (book, ..) = two_peer_book();
        assert_eq!(book.size(), 3);
        assert!(!book.empty());
        check_invariants(&book);
        assert_eq!(book.to_string(), "3 paths");
    }

    #[test]
    fn test_display_marks_unfinalized() {
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:80", None));
        assert_eq!(book.to_string(), "1+ paths");
    }

    #[test]
    fn test_extract_front_takes_leftmost() {
        let (mut book, ..) = two_peer_book();
        let first = book.extract_front();
        assert_eq!(first.connection.remote().to_string(), "192.0.2.1:3128");
        assert_eq!(book.size(), 2);
        check_invariants(&book);
    }

    #[test]
    #[should_panic(expected = "empty path book")]
    fn test_extract_front_empty_panics() {
        let mut book = PathBook::new();
        let _ = book.extract_front();
    }

    #[test]
    fn test_prime_before_spare_scenario() {
        let (mut book, ..) = two_peer_book();

        // work starts on peerA's v4 prime
        let current = book.extract_front();
        assert_eq!(current.connection.remote().to_string(), "192.0.2.1:3128");

        // the spare is peerA's v6 path
        let spare = book.extract_spare(&current.connection).unwrap();
        assert_eq!(spare.connection.family(), AddressFamily::V6);
        assert!(spare.connection.same_peer_as(&current.connection));

        // no primes remain for peerA, and peerB's presence proves it
        assert!(book.extract_prime(&current.connection).is_none());
        assert!(book.done_with_primes(&current.connection));
        check_invariants(&book);
    }

    #[test]
    fn test_retry_reinsertion_scenario() {
        let (mut book, ..) = two_peer_book();

        let first = book.extract_front();
        let second = book.extract_front();
        assert_eq!(book.paths_to_skip, 2);
        assert_eq!(book.size(), 1);
        drop(second);

        book.retry_path(first);
        assert_eq!(book.paths_to_skip, 0);
        assert_eq!(book.size(), 2);
        check_invariants(&book);

        let again = book.extract_front();
        assert_eq!(again.connection.remote().to_string(), "192.0.2.1:3128");
    }

    #[test]
    fn test_retry_middle_path_keeps_prefix() {
        let (mut book, ..) = two_peer_book();
        let first = book.extract_front();
        let second = book.extract_front();
        assert_eq!(book.paths_to_skip, 2);

        // returning only the second path moves the prefix to it
        book.retry_path(second);
        assert_eq!(book.paths_to_skip, 1);
        check_invariants(&book);
        drop(first);
    }

    #[test]
    #[should_panic(expected = "never extracted")]
    fn test_retry_available_path_panics() {
        let (mut book, ..) = two_peer_book();
        let first = book.extract_front();
        let forged = ExtractedPath {
            connection: first.connection.copy_details(),
            position: 1, // slot 1 is still occupied
        };
        book.retry_path(forged);
    }

    #[test]
    fn test_spare_scan_stops_at_other_peer() {
        let peer_a = Arc::new(CachePeer::new("a", "a.example.net"));
        let peer_b = Arc::new(CachePeer::new("b", "b.example.net"));

        // peerA has only v4; the first spare-family path belongs to peerB
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:3128", Some(&peer_a)));
        book.add(path("192.0.2.2:3128", Some(&peer_b)));
        book.add(path("[2001:db8::2]:3128", Some(&peer_b)));

        let current = book.extract_front();
        assert!(!book.have_spare(&current.connection));
        assert!(book.extract_spare(&current.connection).is_none());

        // not finalized, but the other peer's paths make the answer final
        assert!(book.done_with_spares(&current.connection));
        assert!(book.done_with_peer(&current.connection));
    }

    #[test]
    fn test_done_requires_finalized_or_other() {
        let peer_a = Arc::new(CachePeer::new("a", "a.example.net"));
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:3128", Some(&peer_a)));

        let current = book.extract_front();
        // nothing left, but more paths may still arrive
        assert!(!book.done_with_primes(&current.connection));
        assert!(!book.done_with_spares(&current.connection));
        assert!(!book.done_with_peer(&current.connection));

        book.finalize();
        assert!(book.done_with_primes(&current.connection));
        assert!(book.done_with_spares(&current.connection));
        assert!(book.done_with_peer(&current.connection));
    }

    #[test]
    fn test_prime_requires_leftmost_match() {
        let peer_a = Arc::new(CachePeer::new("a", "a.example.net"));
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:3128", Some(&peer_a)));
        book.add(path("192.0.2.5:3128", Some(&peer_a)));

        let current = book.extract_front();
        // slot 1 is a prime for peerA and is the leftmost available path
        let prime = book.extract_prime(&current.connection).unwrap();
        assert_eq!(prime.connection.remote().to_string(), "192.0.2.5:3128");
        assert!(book.extract_prime(&current.connection).is_none());
    }

    #[test]
    fn test_direct_origin_paths_group_together() {
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:80", None));
        book.add(path("[2001:db8::1]:80", None));
        book.finalize();

        let current = book.extract_front();
        let spare = book.extract_spare(&current.connection).unwrap();
        assert_eq!(spare.connection.family(), AddressFamily::V6);
        assert!(book.done_with_peer(&current.connection));
    }

    #[test]
    fn test_extract_all_then_book_empty() {
        let (mut book, ..) = two_peer_book();
        let mut extracted = Vec::new();
        while !book.empty() {
            extracted.push(book.extract_front());
        }
        assert_eq!(extracted.len(), 3);
        assert_eq!(book.paths_to_skip, 3);
        check_invariants(&book);

        // positions are the original insertion order
        let positions: Vec<_> = extracted.iter().map(ExtractedPath::position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_add_after_extraction_keeps_prefix() {
        let peer_a = Arc::new(CachePeer::new("a", "a.example.net"));
        let mut book = PathBook::new();
        book.add(path("192.0.2.1:3128", Some(&peer_a)));

        let first = book.extract_front();
        assert!(book.empty());
        assert_eq!(book.paths_to_skip, 1);

        book.add(path("[2001:db8::1]:3128", Some(&peer_a)));
        assert_eq!(book.size(), 1);
        assert_eq!(book.paths_to_skip, 1);
        check_invariants(&book);

        let spare = book.extract_spare(&first.connection).unwrap();
        assert_eq!(spare.position(), 1);
    }
}
