//! The TLS-library seam
//!
//! The driver never touches TLS internals; it steps an opaque session
//! and reacts to what the step reports. Everything the library must
//! expose for that — the step outcome, hold-read inspection, the
//! received chain, certificate decoding — is collected in the
//! [`TlsSession`] trait.

use std::fmt;
use std::sync::Arc;

use crate::validator::CertErrorPolicy;

/// An X.509 certificate as far as the driver cares: enough identity to
/// chase issuers, plus the raw DER for whoever needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Subject distinguished name
    pub subject: String,

    /// Issuer distinguished name
    pub issuer: String,

    /// Where the issuer certificate can be fetched, when the AIA
    /// extension says so
    pub issuer_uri: Option<String>,

    /// DER encoding
    pub der: Vec<u8>,
}

impl Certificate {
    /// Whether this certificate signs itself (chain root; nothing to
    /// fetch above it).
    #[must_use]
    pub fn self_signed(&self) -> bool {
        self.subject == self.issuer
    }
}

/// One certificate verification error, library numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertError {
    /// Library error code
    pub code: i64,

    /// Certificate the error is about, when the library attributes one
    pub cert: Option<Certificate>,

    /// Position of that certificate in the chain
    pub depth: i32,
}

/// The error the forwarding engine shows for a failed peer: which check
/// failed, on which certificate, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Library error code of the honored error
    pub code: i64,

    /// The peer's leaf certificate
    pub peer_cert: Option<Certificate>,

    /// The certificate that failed the check, if different
    pub broken_cert: Option<Certificate>,

    /// Human-readable reason from the validator, if it gave one
    pub reason: Option<String>,
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "certificate error {}", self.code)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

/// How one handshake step classified its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorClass {
    /// Protocol-level library error
    Library,
    /// The underlying syscall failed
    Syscall,
    /// Anything else the library reports
    Other,
}

/// A failed handshake step, with the raw numbers the error record keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    /// Failure class
    pub class: StepErrorClass,

    /// The library's I/O-result code for this step
    pub io_code: i32,

    /// Library error-queue code; zero when the queue was empty
    pub library_code: u64,

    /// Return value of the step call
    pub ret: i32,

    /// errno observed by the session at failure time
    pub errno: i32,
}

/// Outcome of driving the handshake one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Negotiation finished
    Done,
    /// The library needs the socket to become readable
    WantRead,
    /// The library needs the socket to become writable
    WantWrite,
    /// Negotiation failed
    Failed(StepError),
}

/// Protocol version and cipher the library settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedInfo {
    /// Protocol version, e.g. `TLSv1.3`
    pub protocol: String,

    /// Cipher suite
    pub cipher: String,
}

/// Session allocation failed before the first handshake step.
#[derive(Debug, Clone)]
pub struct SessionInitError {
    /// errno to report on the socket-failure error
    pub errno: i32,

    /// What went wrong
    pub reason: String,
}

/// The driver's view of one TLS client session.
///
/// Real implementations wrap the TLS library's session bound to the
/// connection's socket; tests script the steps.
pub trait TlsSession: Send {
    /// Drive the handshake one step.
    fn drive_handshake(&mut self) -> HandshakeStep;

    /// Whether the transport layer is holding reads for inspection
    /// (peeking at the server's first flight before the library parses
    /// it).
    fn hold_read(&self) -> bool;

    /// Stop holding reads; the next step lets the library consume what
    /// was captured.
    fn release_read_hold(&mut self);

    /// Whether a ServerHello has been captured while holding reads.
    fn saw_server_hello(&self) -> bool;

    /// Whether capturing the server's first flight failed to parse.
    fn hello_parse_failed(&self) -> bool;

    /// The certificate chain the server sent, leaf first; empty before
    /// the server's flight arrives.
    fn server_certificates(&self) -> Vec<Certificate>;

    /// Add a fetched certificate to the untrusted store used to
    /// complete the chain.
    fn add_untrusted_certificate(&mut self, cert: Certificate);

    /// Decode a DER blob; `None` when it does not parse.
    fn decode_certificate(&self, der: &[u8]) -> Option<Certificate>;

    /// The peer's leaf certificate, once received.
    fn peer_certificate(&self) -> Option<Certificate>;

    /// Verification errors accumulated so far, for the validator.
    fn accumulated_errors(&self) -> Option<Vec<CertError>>;

    /// Replace the accumulated error list with the validator's verdict.
    fn replace_errors(&mut self, errors: Vec<CertError>);

    /// Detach the error detail the in-handshake verify callback left
    /// behind, if any.
    fn take_error_detail(&mut self) -> Option<ErrorDetail>;

    /// Install the certificate-error policy for in-handshake
    /// verification; used only when no external validator will run.
    fn install_error_policy(&mut self, policy: Arc<dyn CertErrorPolicy>);

    /// What the handshake settled on, once it got far enough.
    fn negotiated(&self) -> Option<NegotiatedInfo>;
}

/// Issuer-fetch URLs for every certificate in `chain` whose issuer is
/// not itself present, in chain order and without duplicates.
#[must_use]
pub fn missing_issuer_urls(chain: &[Certificate]) -> Vec<String> {
    let mut urls = Vec::new();
    for cert in chain {
        if let Some(url) = issuer_uri_if_missing(cert, chain) {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    urls
}

/// Where to fetch `cert`'s issuer, unless the chain already carries it
/// (or the certificate roots itself).
#[must_use]
pub fn issuer_uri_if_missing(cert: &Certificate, chain: &[Certificate]) -> Option<String> {
    if cert.self_signed() {
        return None;
    }
    if chain.iter().any(|candidate| candidate.subject == cert.issuer) {
        return None;
    }
    cert.issuer_uri.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(subject: &str, issuer: &str, uri: Option<&str>) -> Certificate {
        Certificate {
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            issuer_uri: uri.map(String::from),
            der: Vec::new(),
        }
    }

    #[test]
    fn test_complete_chain_has_no_missing_issuers() {
        let chain = vec![
            cert("leaf", "intermediate", Some("http://ca.example/int.der")),
            cert("intermediate", "root", Some("http://ca.example/root.der")),
            cert("root", "root", None),
        ];
        assert!(missing_issuer_urls(&chain).is_empty());
    }

    #[test]
    fn test_missing_intermediate_is_reported() {
        let chain = vec![cert("leaf", "intermediate", Some("http://ca.example/int.der"))];
        assert_eq!(
            missing_issuer_urls(&chain),
            vec!["http://ca.example/int.der".to_string()]
        );
    }

    #[test]
    fn test_duplicate_urls_collapse() {
        let chain = vec![
            cert("leaf-a", "intermediate", Some("http://ca.example/int.der")),
            cert("leaf-b", "intermediate", Some("http://ca.example/int.der")),
        ];
        assert_eq!(missing_issuer_urls(&chain).len(), 1);
    }

    #[test]
    fn test_self_signed_without_uri_is_fine() {
        let chain = vec![cert("root", "root", None)];
        assert!(missing_issuer_urls(&chain).is_empty());
        assert!(issuer_uri_if_missing(&chain[0], &chain).is_none());
    }

    #[test]
    fn test_missing_issuer_without_uri_yields_nothing() {
        let chain = vec![cert("leaf", "intermediate", None)];
        assert!(missing_issuer_urls(&chain).is_empty());
    }
}
