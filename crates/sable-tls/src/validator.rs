//! The external certificate validator seam
//!
//! Chains that survive the handshake go to an out-of-process validator
//! before the connection is handed back. The driver submits the domain
//! and the errors the library accumulated; the reply either blesses the
//! chain, lists per-certificate errors, or reports that the helper
//! itself broke.

use async_trait::async_trait;

use crate::session::{CertError, Certificate};

/// What the driver sends to the validator.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Domain name the connection is for (SNI / certificate subject)
    pub domain: String,

    /// Verification errors the library accumulated during the handshake
    pub errors: Vec<CertError>,
}

/// Validator verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Chain accepted
    Ok,
    /// Chain rejected; per-certificate errors attached
    Error,
    /// The helper failed or produced a malformed reply
    HelperFailure,
}

/// One error from the validator's reply.
#[derive(Debug, Clone)]
pub struct ValidatorErrorItem {
    /// Library error code; never the "no error" code
    pub code: i64,

    /// Human-readable reason, possibly empty
    pub reason: String,

    /// Certificate the error is about
    pub cert: Option<Certificate>,

    /// Chain position of that certificate
    pub depth: i32,
}

/// The validator's reply.
#[derive(Debug, Clone)]
pub struct ValidationReply {
    /// Overall verdict
    pub result: ValidationResult,

    /// Per-certificate errors; meaningful when the verdict is
    /// [`ValidationResult::Error`]
    pub errors: Vec<ValidatorErrorItem>,
}

/// Asynchronous certificate validator transport.
///
/// Transport failures are reported as
/// [`ValidationResult::HelperFailure`]; the driver turns those into a
/// gateway failure.
#[async_trait]
pub trait CertValidator: Send + Sync {
    /// Submit a chain for validation and wait for the verdict.
    async fn validate(&self, request: ValidationRequest) -> ValidationReply;
}

/// The `cert_error` access-list surface: which certificate errors the
/// configuration bypasses for this connection.
pub trait CertErrorPolicy: Send + Sync {
    /// Whether the given error may be ignored.
    fn allows(&self, error: &CertError) -> bool;
}
