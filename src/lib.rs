//! # sable
//!
//! Forwarding core of an HTTP(S) caching proxy, split into three
//! crates:
//!
//! - [`core`](sable_core): connection descriptors, the candidate path
//!   book, configuration, and the ambient task context
//! - [`collapse`](sable_collapse): the cross-worker transient index
//!   behind collapsed forwarding
//! - [`tls`](sable_tls): the outbound TLS peer-negotiation driver
//!
//! This crate re-exports all three for consumers that want the whole
//! forwarding surface under one roof.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use sable_collapse as collapse;
pub use sable_core as core;
pub use sable_tls as tls;
