//! # sable-tls
//!
//! Drives outbound TLS handshakes for the forwarding engine: a one-shot
//! asynchronous job per connection that negotiates with the origin or
//! cache peer, hands certificate chains to an out-of-process validator,
//! and fetches missing intermediate certificates on demand.
//!
//! The TLS library itself, the validator, the downloader, and the
//! certificate-error policy are collaborators behind traits; this crate
//! owns only the state machine between them:
//!
//! ```text
//! INIT → PREPARED → NEGOTIATING → (VALIDATING)? → DONE | FAILED
//!              ↑          │
//!              └─ FETCHING_CERTS ←┘ (missing intermediates)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod completion;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod session;
pub mod validator;

pub use completion::{Completion, CompletionHandle, completion_channel};
pub use driver::{
    HandshakeAnswer, HandshakeDriver, HandshakeParams, MAX_CERT_DOWNLOADS, MAX_NESTED_DOWNLOADS,
};
pub use error::{HandshakeError, HandshakeFailure};
pub use fetcher::{CertFetcher, FetchOutcome};
pub use session::{
    CertError, Certificate, ErrorDetail, HandshakeStep, NegotiatedInfo, SessionInitError,
    StepError, StepErrorClass, TlsSession, missing_issuer_urls,
};
pub use validator::{
    CertErrorPolicy, CertValidator, ValidationReply, ValidationRequest, ValidationResult,
    ValidatorErrorItem,
};
