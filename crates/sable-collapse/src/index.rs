//! Per-worker transient index
//!
//! `Transients` is what a worker's store layer talks to: it publishes
//! in-flight misses, attaches late requests to fetches other workers
//! already started, and relays abort/eviction signals. All cross-worker
//! state lives in the [`CollapseSegment`] every worker shares.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use sable_core::config::CollapseConfig;

use crate::bus::{ChangeBus, CollapseNotice};
use crate::entry::{CollapseEntry, IoRole};
use crate::error::CollapseError;
use crate::key::CacheKey;
use crate::slot::{MAX_URL, SlotExtras, SlotTable};

/// The state shared by every worker: the slot table and the change bus.
#[derive(Debug)]
pub struct CollapseSegment {
    table: SlotTable,
    bus: ChangeBus,
}

impl CollapseSegment {
    /// Create the segment, or `None` when collapsed forwarding is
    /// disabled or misconfigured.
    #[must_use]
    pub fn new(config: &CollapseConfig) -> Option<Arc<Self>> {
        if !config.collapsed_forwarding || config.shared_entries_limit == 0 {
            return None;
        }
        debug!(
            entries = config.shared_entries_limit,
            "creating collapsed-forwarding segment"
        );
        Some(Arc::new(Self {
            table: SlotTable::new(config.shared_entries_limit),
            bus: ChangeBus::new(64),
        }))
    }

    /// Subscribe to entry-change notices.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CollapseNotice> {
        self.bus.subscribe()
    }

    /// Number of occupied slots, advisory.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.table.entry_count()
    }

    /// Entry limit fixed at creation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}

/// Read-only snapshot of a shared slot's fate, as seen by one holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStatus {
    /// The writer stopped before completing. Only meaningful once the
    /// writer is gone; while a writer holds the slot this reads false.
    pub aborted: bool,

    /// The entry is flagged for deletion and will be recycled once its
    /// locks drop
    pub waiting_to_be_freed: bool,
}

/// The narrow storage capability the forwarding engine needs: lookup and
/// eviction by key. The transient index provides both without owning any
/// response data.
pub trait TransientReach {
    /// Attach to the in-flight entry for `key`, if one accepts readers.
    fn find(&self, key: &CacheKey) -> Option<Arc<CollapseEntry>>;

    /// Flag the entry for `key` for deletion, wherever it is.
    fn evict(&self, key: &CacheKey);
}

/// One worker's front-end to the shared transient table.
#[derive(Debug)]
pub struct Transients {
    segment: Option<Arc<CollapseSegment>>,
    locals: Mutex<Vec<Option<Arc<CollapseEntry>>>>,
}

impl Transients {
    /// Attach this worker to the shared segment. With `None` the index
    /// is inert: every operation no-ops the way the disabled feature
    /// demands.
    #[must_use]
    pub fn attach(segment: Option<Arc<CollapseSegment>>) -> Self {
        let locals = segment
            .as_ref()
            .map(|segment| vec![None; segment.capacity()])
            .unwrap_or_default();
        Self {
            segment,
            locals: Mutex::new(locals),
        }
    }

    /// An index with collapsed forwarding disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self::attach(None)
    }

    /// Whether this worker participates in collapsed forwarding.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.segment.is_some()
    }

    /// Publish `entry` as the in-flight fetch for its key.
    ///
    /// A collision means another worker (or an earlier request on this
    /// one) already owns the fetch; the caller attaches as a reader
    /// instead.
    pub fn start_writing(&self, entry: &Arc<CollapseEntry>) -> Result<(), CollapseError> {
        let segment = self.segment.as_ref().ok_or(CollapseError::Disabled)?;
        let index = self.add_entry(segment, entry)?;
        // open the slot to readers only once the extras are in place
        segment.table.start_appending(index);
        entry.bind(index, IoRole::Writing);
        self.install_local(index, entry);
        debug!(key = %entry.key(), index, "publishing in-flight miss");
        Ok(())
    }

    /// Keep a read lock on an already-public entry to learn of remote
    /// deletions while this worker serves it from its own store.
    pub fn monitor_while_reading(&self, entry: &Arc<CollapseEntry>) -> Result<(), CollapseError> {
        let segment = self.segment.as_ref().ok_or(CollapseError::Disabled)?;
        if !entry.attached() {
            let index = self.add_entry(segment, entry)?;
            segment.table.close_for_writing(index, true);
            entry.bind(index, IoRole::Reading);
        }
        if let Some(index) = entry.index() {
            self.install_local(index, entry);
        }
        Ok(())
    }

    /// Open a shared slot for `key`, copy the extras into a local entry,
    /// and reserve the slot's write lock for this worker's fetch.
    fn add_entry(
        &self,
        segment: &CollapseSegment,
        entry: &Arc<CollapseEntry>,
    ) -> Result<usize, CollapseError> {
        assert!(!entry.attached(), "entry already has a transient slot");

        let index = segment
            .table
            .open_for_writing(&entry.key())
            .ok_or(CollapseError::Collision)?;

        if entry.url().len() > MAX_URL {
            // the slot cannot represent this request; give it back
            segment.table.abort_writing(index);
            return Err(CollapseError::Oversized);
        }
        segment.table.store_extras(
            index,
            SlotExtras {
                key: entry.key(),
                url: entry.url().to_string(),
                method: entry.method(),
                flags: entry.flags(),
            },
        );
        Ok(index)
    }

    /// Attach to the in-flight entry for `key` as a reader.
    ///
    /// Refuses when this worker already holds the slot (the local entry
    /// went private), when the entry is complete (late joiners fetch for
    /// themselves), or when the extras cannot be copied.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CollapseEntry>> {
        let segment = self.segment.as_ref()?;
        let (index, complete) = segment.table.open_for_reading(key)?;

        let already_held = self
            .lock_locals()
            .get(index)
            .is_some_and(Option::is_some);
        if already_held {
            // our store lookup missed it, so the local entry must have
            // been re-keyed private; do not let new clients join it
            debug!(key = %key, index, "not joining privatized entry");
            segment.table.close_for_reading(index);
            return None;
        }

        if complete {
            trace!(key = %key, index, "entry already complete; not joining");
            segment.table.close_for_reading(index);
            return None;
        }

        let Some(extras) = segment.table.copy_extras(index) else {
            segment.table.close_for_reading(index);
            return None;
        };

        let entry = Arc::new(CollapseEntry::new(
            extras.key,
            extras.url,
            extras.method,
            extras.flags,
        ));
        entry.bind(index, IoRole::Reading);
        self.install_local(index, &entry);
        debug!(key = %key, index, "joined in-flight miss as reader");
        // the read lock stays held so the entry keeps receiving updates
        Some(entry)
    }

    /// Writer finished successfully. Existing readers keep their copies;
    /// new requests for the key fetch for themselves.
    pub fn complete_writing(&self, entry: &Arc<CollapseEntry>) {
        let Some(segment) = self.segment.as_ref() else {
            return;
        };
        let mut attachment = entry.lock_attachment();
        assert!(
            attachment.io == IoRole::Writing,
            "complete_writing by a non-writer"
        );
        let Some(index) = attachment.index.take() else {
            unreachable!("writer role without a slot")
        };
        segment.table.close_for_writing(index, false);
        attachment.io = IoRole::Done;
        drop(attachment);
        self.clear_local(index);
        debug!(key = %entry.key(), index, "completed in-flight miss");
    }

    /// Writer failed or is giving up. The slot is flagged for deletion
    /// while the write lock is still held, so no new reader collapses on
    /// it, and attached readers are woken to observe the abort.
    pub fn abandon(&self, entry: &Arc<CollapseEntry>) {
        let Some(segment) = self.segment.as_ref() else {
            return;
        };
        let Some(index) = entry.index() else {
            return;
        };
        debug!(key = %entry.key(), index, "abandoning in-flight miss");
        if segment.table.free_entry(index) {
            segment.bus.broadcast(CollapseNotice {
                index,
                key: entry.key(),
            });
        }
    }

    /// Drop this worker's attachment. Idempotent.
    pub fn disconnect(&self, entry: &Arc<CollapseEntry>) {
        let Some(segment) = self.segment.as_ref() else {
            return;
        };
        let mut attachment = entry.lock_attachment();
        let Some(index) = attachment.index.take() else {
            return;
        };
        match attachment.io {
            IoRole::Writing => segment.table.abort_writing(index),
            IoRole::Reading => segment.table.close_for_reading(index),
            IoRole::Idle | IoRole::Done => {}
        }
        attachment.io = IoRole::Done;
        drop(attachment);
        self.clear_local(index);
        trace!(key = %entry.key(), index, "disconnected from transient slot");
    }

    /// Snapshot the shared fate bits of an attached entry.
    ///
    /// # Panics
    ///
    /// Panics when the entry has no backing slot; only attached holders
    /// may ask.
    #[must_use]
    pub fn status(&self, entry: &Arc<CollapseEntry>) -> EntryStatus {
        let segment = self
            .segment
            .as_ref()
            .unwrap_or_else(|| panic!("status() without a shared segment"));
        let Some(index) = entry.index() else {
            panic!("status() on an entry with no backing slot")
        };
        // the aborted flag is only meaningful once the writer is gone;
        // reading it mid-write would race the writer's own updates
        EntryStatus {
            aborted: !segment.table.is_write_locked(index) && segment.table.is_aborted(index),
            waiting_to_be_freed: segment.table.is_waiting_to_be_freed(index),
        }
    }

    /// Current read-lock count on the entry's slot; advisory.
    #[must_use]
    pub fn readers(&self, entry: &Arc<CollapseEntry>) -> u32 {
        match (&self.segment, entry.index()) {
            (Some(segment), Some(index)) => segment.table.readers(index),
            _ => 0,
        }
    }

    /// Flag the entry for `key` for deletion and wake its readers.
    pub fn evict_if_found(&self, key: &CacheKey) {
        let Some(segment) = self.segment.as_ref() else {
            return;
        };
        let Some(index) = segment.table.index_of(key) else {
            return;
        };
        if segment.table.free_entry(index) {
            segment.bus.broadcast(CollapseNotice { index, key: *key });
        }
    }

    /// Evict an entry this worker may be holding; attached entries route
    /// through [`Transients::abandon`] so their readers learn.
    pub fn evict_cached(&self, entry: &Arc<CollapseEntry>) {
        if entry.attached() {
            self.abandon(entry);
        } else {
            self.evict_if_found(&entry.key());
        }
    }

    /// The local entry attached at `index`, if any. Used when a change
    /// notice names a slot this worker may be serving.
    #[must_use]
    pub fn find_collapsed(&self, index: usize) -> Option<Arc<CollapseEntry>> {
        self.lock_locals().get(index).cloned().flatten()
    }

    /// Whether the entry for `key` is flagged for deletion.
    #[must_use]
    pub fn marked_for_deletion(&self, key: &CacheKey) -> bool {
        self.segment
            .as_ref()
            .is_some_and(|segment| segment.table.marked_for_deletion(key))
    }

    fn install_local(&self, index: usize, entry: &Arc<CollapseEntry>) {
        let mut locals = self.lock_locals();
        match &locals[index] {
            Some(existing) => {
                assert!(
                    Arc::ptr_eq(existing, entry),
                    "slot {index} already held by a different local entry"
                );
            }
            None => locals[index] = Some(entry.clone()),
        }
    }

    fn clear_local(&self, index: usize) {
        self.lock_locals()[index] = None;
    }

    fn lock_locals(&self) -> std::sync::MutexGuard<'_, Vec<Option<Arc<CollapseEntry>>>> {
        self.locals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransientReach for Transients {
    fn find(&self, key: &CacheKey) -> Option<Arc<CollapseEntry>> {
        self.get(key)
    }

    fn evict(&self, key: &CacheKey) {
        self.evict_if_found(key);
    }
}
