//! # sable-core
//!
//! Per-worker building blocks of the sable forwarding engine:
//! - Connection descriptors and cache-peer records
//! - The candidate path book (ordered prime/spare selection with retry)
//! - The ambient task context used to tag diagnostics
//! - Forwarding configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Forwarding engine                        │
//! │   (owns a PathBook, extracts Connections, retries losers)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │   PathBook          │  Connection / CachePeer               │
//! │   (candidate order) │  (addresses, socket, peer back-ref)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Task context (ambient diagnostics tag)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything in this crate is worker-local: one cooperative event loop
//! owns each value, and nothing here is shared across workers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod paths;
pub mod peer;

pub use config::{CollapseConfig, ForwardConfig};
pub use connection::{AddressFamily, Connection, NegotiationHistory};
pub use context::{ContextGuard, TaskContext, call_service_back, current, reset, run_in};
pub use error::ConfigError;
pub use paths::{ExtractedPath, PathBook};
pub use peer::CachePeer;
