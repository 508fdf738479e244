//! Local transient entries
//!
//! A `CollapseEntry` is one worker's view of an in-flight miss: the
//! request metadata plus this worker's attachment to the shared slot.
//! The writer worker creates its entry before publishing; readers get
//! synthetic entries built from the slot's extras.

use std::sync::Mutex;
use std::sync::PoisonError;

use crate::key::{CacheKey, Method, RequestFlags};

/// A worker's relation to a transient slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoRole {
    /// Not attached to any slot yet
    #[default]
    Idle,
    /// Attached with a read lock, consuming the writer's progress
    Reading,
    /// Attached with the write lock, producing the response
    Writing,
    /// Attachment finished; the entry no longer tracks a slot
    Done,
}

/// This worker's attachment state, updated by the [`Transients`] index.
///
/// [`Transients`]: crate::index::Transients
#[derive(Debug, Default)]
pub(crate) struct Attachment {
    pub index: Option<usize>,
    pub io: IoRole,
}

/// One worker's record of an in-flight miss.
#[derive(Debug)]
pub struct CollapseEntry {
    key: CacheKey,
    url: String,
    method: Method,
    flags: RequestFlags,
    pub(crate) attachment: Mutex<Attachment>,
}

impl CollapseEntry {
    /// Create a detached entry for a request this worker handles.
    #[must_use]
    pub fn new(key: CacheKey, url: impl Into<String>, method: Method, flags: RequestFlags) -> Self {
        Self {
            key,
            url: url.into(),
            method,
            flags,
            attachment: Mutex::new(Attachment::default()),
        }
    }

    /// Cache key this entry collapses under.
    #[must_use]
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Request flags inherited by readers.
    #[must_use]
    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    /// This worker's current role for the entry.
    #[must_use]
    pub fn io_role(&self) -> IoRole {
        self.lock_attachment().io
    }

    /// The shared slot this entry is attached to, if any.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.lock_attachment().index
    }

    /// Whether the entry currently tracks a shared slot.
    #[must_use]
    pub fn attached(&self) -> bool {
        self.index().is_some()
    }

    pub(crate) fn bind(&self, index: usize, io: IoRole) {
        let mut attachment = self.lock_attachment();
        attachment.index = Some(index);
        attachment.io = io;
    }

    pub(crate) fn lock_attachment(&self) -> std::sync::MutexGuard<'_, Attachment> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
