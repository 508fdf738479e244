//! Error types for TLS peer negotiation.

use std::fmt;

use thiserror::Error;

use crate::session::{Certificate, ErrorDetail};

/// The structured record of a failed handshake: the raw library codes
/// plus whatever certificates and reasons were involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFailure {
    /// Library error-queue code; zero when the queue was empty
    pub library_code: u64,

    /// The library's I/O-result code for the failing step
    pub io_code: i32,

    /// errno to report; the observed errno only for a bare syscall
    /// failure, otherwise the protocol-error default
    pub syscall_errno: i32,

    /// Certificate that failed verification, when one was singled out
    pub broken_cert: Option<Certificate>,

    /// The peer's leaf certificate, when received
    pub peer_cert: Option<Certificate>,

    /// Reason text attached by the verify callback, if any
    pub reason: Option<String>,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TLS handshake failure (lib={:#x}, io={}, errno={})",
            self.library_code, self.io_code, self.syscall_errno
        )?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

/// Everything a negotiation job can report through its completion
/// callback.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Allocating or binding the TLS session failed
    #[error("TLS socket initialization failed (errno {errno})")]
    SocketFailure {
        /// errno captured at initialization time
        errno: i32,
    },

    /// The connection closed or reset while the job was suspended
    #[error("connection gone during TLS negotiation")]
    SocketClosed,

    /// The library reported a handshake failure
    #[error("{0}")]
    Negotiation(HandshakeFailure),

    /// The validator rejected the chain and the policy did not bypass
    /// every error
    #[error("secure connect failed: {detail}")]
    CertificateErrors {
        /// The first honored certificate error
        detail: ErrorDetail,
    },

    /// The external validator failed or replied with garbage
    #[error("certificate validator failure")]
    ValidatorFailure,

    /// The negotiation deadline or read timeout expired
    #[error("TLS negotiation timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display_includes_codes() {
        let failure = HandshakeFailure {
            library_code: 0x1416f086,
            io_code: 1,
            syscall_errno: 0,
            broken_cert: None,
            peer_cert: None,
            reason: Some("certificate verify failed".to_string()),
        };
        let rendered = failure.to_string();
        assert!(rendered.contains("0x1416f086"));
        assert!(rendered.contains("certificate verify failed"));
    }
}
