//! Shared slot table
//!
//! The fixed-size table behind collapsed forwarding. Each slot carries a
//! single-writer multi-reader lock built from atomics, a small set of
//! lifecycle flags, and a mutex-guarded extras block that is copied in
//! and out whole. A `DashMap` maps cache keys to slot indices.
//!
//! Lock discipline: a slot's extras mutex is only ever taken while no
//! key-map shard lock is held on the lookup side, and the recycle path
//! is the only one that takes the key map while holding an extras mutex.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::key::{CacheKey, Method, RequestFlags};

/// Longest URL the extras block stores; oversized requests cannot be
/// shared and must abort their slot.
pub(crate) const MAX_URL: usize = 8 * 1024;

const STATE_EMPTY: u8 = 0;
const STATE_WRITING: u8 = 1;
const STATE_READABLE: u8 = 2;

/// Request metadata a reader needs to reconstruct the writer's entry.
#[derive(Debug, Clone)]
pub(crate) struct SlotExtras {
    pub key: CacheKey,
    pub url: String,
    pub method: Method,
    pub flags: RequestFlags,
}

#[derive(Debug)]
struct Slot {
    /// Lifecycle word: empty, being written, or readable
    state: AtomicU8,

    /// Whether readers may attach while the writer is still appending
    appending: AtomicBool,

    /// Read-lock count; advisory for observers, exact for recycling
    readers: AtomicU32,

    /// Write lock
    write_locked: AtomicBool,

    /// The writer stopped before completing
    aborted: AtomicBool,

    /// Flagged for deletion; recycled once all locks drop
    waiting_to_be_freed: AtomicBool,

    extras: Mutex<Option<SlotExtras>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_EMPTY),
            appending: AtomicBool::new(false),
            readers: AtomicU32::new(0),
            write_locked: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            waiting_to_be_freed: AtomicBool::new(false),
            extras: Mutex::new(None),
        }
    }

    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn lock_extras(&self) -> std::sync::MutexGuard<'_, Option<SlotExtras>> {
        self.extras.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-capacity keyed slot table with per-slot single-writer
/// multi-reader locks.
#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    by_key: DashMap<CacheKey, usize>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            by_key: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Open a slot for `key` in writer mode.
    ///
    /// Returns `None` when the key is already present (another worker
    /// owns the fetch) or when no free slot remains.
    pub fn open_for_writing(&self, key: &CacheKey) -> Option<usize> {
        match self.by_key.entry(*key) {
            Entry::Occupied(_) => {
                trace!(key = %key, "write collision: key already mapped");
                None
            }
            Entry::Vacant(vacant) => {
                let index = self.allocate()?;
                // seed the extras with the key so the recycler can drop
                // the mapping even if the writer never stores them; the
                // appending gate keeps readers away until it does
                *self.slots[index].lock_extras() = Some(SlotExtras {
                    key: *key,
                    url: String::new(),
                    method: Method::Get,
                    flags: RequestFlags::default(),
                });
                vacant.insert(index);
                Some(index)
            }
        }
    }

    fn allocate(&self) -> Option<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(
                    STATE_EMPTY,
                    STATE_WRITING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.write_locked.store(true, Ordering::Release);
                slot.appending.store(false, Ordering::Release);
                slot.aborted.store(false, Ordering::Release);
                slot.waiting_to_be_freed.store(false, Ordering::Release);
                return Some(index);
            }
        }
        trace!("slot table full");
        None
    }

    /// Store the extras a reader will copy out later. Writer-only.
    pub fn store_extras(&self, index: usize, extras: SlotExtras) {
        *self.slots[index].lock_extras() = Some(extras);
    }

    /// Copy the extras block out, if the writer stored it already.
    pub fn copy_extras(&self, index: usize) -> Option<SlotExtras> {
        self.slots[index].lock_extras().clone()
    }

    /// Allow readers to attach while the writer keeps appending.
    pub fn start_appending(&self, index: usize) {
        self.slots[index].appending.store(true, Ordering::Release);
    }

    /// Open a slot for reading. Returns the index and whether the entry
    /// is already complete; the caller holds one read lock either way.
    pub fn open_for_reading(&self, key: &CacheKey) -> Option<(usize, bool)> {
        let index = *self.by_key.get(key)?;
        let slot = &self.slots[index];

        // lock first, validate after, so a racing recycle cannot free
        // the slot out from under us
        slot.readers.fetch_add(1, Ordering::AcqRel);

        let state = slot.state();
        let usable = (state == STATE_READABLE
            || (state == STATE_WRITING && slot.appending.load(Ordering::Acquire)))
            && !slot.waiting_to_be_freed.load(Ordering::Acquire)
            && !slot.aborted.load(Ordering::Acquire)
            && self.key_matches(index, key);
        if !usable {
            self.close_for_reading(index);
            return None;
        }
        Some((index, state == STATE_READABLE))
    }

    fn key_matches(&self, index: usize, key: &CacheKey) -> bool {
        self.slots[index]
            .lock_extras()
            .as_ref()
            .is_some_and(|extras| extras.key == *key)
    }

    /// Release a read lock.
    pub fn close_for_reading(&self, index: usize) {
        let previous = self.slots[index].readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "read lock released twice");
        self.maybe_recycle(index);
    }

    /// Writer finished; the slot becomes readable (for its existing
    /// readers) and the write lock drops. With `keep_reading` the write
    /// lock converts into a read lock instead of just dropping.
    pub fn close_for_writing(&self, index: usize, keep_reading: bool) {
        let slot = &self.slots[index];
        if keep_reading {
            slot.readers.fetch_add(1, Ordering::AcqRel);
        }
        slot.state.store(STATE_READABLE, Ordering::Release);
        slot.write_locked.store(false, Ordering::Release);
        self.maybe_recycle(index);
    }

    /// Writer gave up: mark the halt, drop the write lock, and let the
    /// slot drain away once its readers leave.
    pub fn abort_writing(&self, index: usize) {
        let slot = &self.slots[index];
        slot.aborted.store(true, Ordering::Release);
        slot.waiting_to_be_freed.store(true, Ordering::Release);
        slot.write_locked.store(false, Ordering::Release);
        self.maybe_recycle(index);
    }

    /// Flag a slot for deletion. Returns whether this call changed the
    /// slot's fate (it was not already dying).
    pub fn free_entry(&self, index: usize) -> bool {
        let newly_marked = self.slots[index]
            .waiting_to_be_freed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if newly_marked {
            self.maybe_recycle(index);
        }
        newly_marked
    }

    /// Slot index currently serving `key`, if any.
    pub fn index_of(&self, key: &CacheKey) -> Option<usize> {
        self.by_key.get(key).map(|entry| *entry)
    }

    pub fn readers(&self, index: usize) -> u32 {
        self.slots[index].readers.load(Ordering::Acquire)
    }

    pub fn is_write_locked(&self, index: usize) -> bool {
        self.slots[index].write_locked.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self, index: usize) -> bool {
        self.slots[index].aborted.load(Ordering::Acquire)
    }

    pub fn is_waiting_to_be_freed(&self, index: usize) -> bool {
        self.slots[index].waiting_to_be_freed.load(Ordering::Acquire)
    }

    pub fn marked_for_deletion(&self, key: &CacheKey) -> bool {
        self.index_of(key)
            .is_some_and(|index| self.is_waiting_to_be_freed(index))
    }

    /// Occupied slots, advisory.
    pub fn entry_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != STATE_EMPTY)
            .count()
    }

    /// Recycle a dying slot once the last lock drops. Safe to call
    /// optimistically; the extras mutex arbitrates concurrent callers.
    fn maybe_recycle(&self, index: usize) {
        let slot = &self.slots[index];
        if !slot.waiting_to_be_freed.load(Ordering::Acquire) {
            return;
        }
        if slot.readers.load(Ordering::Acquire) != 0 || slot.write_locked.load(Ordering::Acquire) {
            return;
        }

        let mut extras = slot.lock_extras();
        // re-check under the extras lock; exactly one caller recycles
        if slot.state() == STATE_EMPTY {
            return;
        }
        if slot.readers.load(Ordering::Acquire) != 0 || slot.write_locked.load(Ordering::Acquire) {
            return;
        }
        if let Some(old) = extras.take() {
            self.by_key.remove_if(&old.key, |_, &index_held| index_held == index);
            trace!(key = %old.key, index, "recycled transient slot");
        }
        slot.appending.store(false, Ordering::Release);
        slot.state.store(STATE_EMPTY, Ordering::Release);
    }
}
