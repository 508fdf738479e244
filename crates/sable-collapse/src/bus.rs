//! Change-notification bus
//!
//! A best-effort multicast channel telling workers "the transient entry
//! for key K changed". Delivery is not guaranteed (a lagging subscriber
//! loses the oldest notices first); consumers treat a notice as a hint
//! to re-sync their local entry from the shared slot.

use tokio::sync::broadcast;
use tracing::trace;

use crate::key::CacheKey;

/// One "entry changed" notice.
#[derive(Debug, Clone, Copy)]
pub struct CollapseNotice {
    /// Shared slot the change happened in
    pub index: usize,

    /// Key the slot was serving when the notice was sent
    pub key: CacheKey,
}

/// Broadcast channel connecting all workers attached to one segment.
#[derive(Debug)]
pub struct ChangeBus {
    tx: broadcast::Sender<CollapseNotice>,
}

impl ChangeBus {
    /// Create a bus that buffers up to `depth` undelivered notices per
    /// subscriber.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        let (tx, _) = broadcast::channel(depth.max(1));
        Self { tx }
    }

    /// Subscribe to future notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CollapseNotice> {
        self.tx.subscribe()
    }

    /// Send a notice to all current subscribers, if any.
    pub fn broadcast(&self, notice: CollapseNotice) {
        trace!(index = notice.index, key = %notice.key, "broadcasting entry change");
        // a segment with no subscribed workers is fine; the notice is
        // best-effort either way
        let _ = self.tx.send(notice);
    }
}
