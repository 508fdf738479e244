//! # sable-collapse
//!
//! Collapsed forwarding: when several workers miss on the same cache key
//! at once, only the first should fetch from upstream; the rest attach
//! to the in-flight fetch and read what the writer produces.
//!
//! ## Architecture
//!
//! ```text
//! worker 0                 worker 1                 worker N
//! ┌──────────┐             ┌──────────┐             ┌──────────┐
//! │Transients│             │Transients│             │Transients│
//! │ locals[] │             │ locals[] │             │ locals[] │
//! └────┬─────┘             └────┬─────┘             └────┬─────┘
//!      │        ┌───────────────┴───────────────┐        │
//!      └────────┤        CollapseSegment        ├────────┘
//!               │  slot table  +  change bus    │
//!               └───────────────────────────────┘
//! ```
//!
//! The segment is the only cross-worker state: a fixed table of slots,
//! each with a single-writer multi-reader lock, plus a best-effort
//! broadcast channel that wakes readers when a writer aborts or an entry
//! is evicted. Each worker's `Transients` front-end tracks its own
//! attachments in a `locals` table indexed by slot id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod entry;
pub mod error;
pub mod index;
pub mod key;
mod slot;

pub use bus::{ChangeBus, CollapseNotice};
pub use entry::{CollapseEntry, IoRole};
pub use error::CollapseError;
pub use index::{CollapseSegment, EntryStatus, TransientReach, Transients};
pub use key::{CacheKey, Method, RequestFlags};
