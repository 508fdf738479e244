//! The TLS peer-negotiation driver
//!
//! A one-shot asynchronous job: given an open connection and a TLS
//! session factory, drive the client handshake to completion and report
//! the outcome through a completion token. The job owns the connection
//! while it runs and hands it back in the answer.
//!
//! One async dependency is outstanding at any time: a readable wait, a
//! writable wait, a validator round-trip, or a certificate download.
//! Negotiation is always re-entered through the scheduler, never
//! directly from whatever completed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sable_core::connection::Connection;

use crate::completion::Completion;
use crate::error::{HandshakeError, HandshakeFailure};
use crate::fetcher::CertFetcher;
use crate::session::{
    CertError, ErrorDetail, HandshakeStep, SessionInitError, StepError, StepErrorClass,
    TlsSession, issuer_uri_if_missing, missing_issuer_urls,
};
use crate::validator::{
    CertErrorPolicy, CertValidator, ValidationRequest, ValidationResult, ValidatorErrorItem,
};

/// Most intermediate-certificate downloads one connection may trigger.
pub const MAX_CERT_DOWNLOADS: u32 = 10;

/// Deepest allowed download-triggers-download nesting.
pub const MAX_NESTED_DOWNLOADS: u32 = 3;

/// Allocates the TLS session once the connection checks out.
pub type SessionFactory<S> =
    Box<dyn FnOnce(&Connection) -> Result<S, SessionInitError> + Send>;

/// Knobs and collaborators for one negotiation job.
pub struct HandshakeParams {
    /// Overall negotiation deadline; `None` leaves only the read
    /// timeout
    pub negotiation_timeout: Option<Duration>,

    /// Global read timeout capping every readable wait
    pub read_timeout: Duration,

    /// Whether to consult the external validator after the handshake
    pub use_cert_validator: bool,

    /// The external validator, when one is configured
    pub validator: Option<Arc<dyn CertValidator>>,

    /// Downloader for missing intermediate certificates
    pub fetcher: Option<Arc<dyn CertFetcher>>,

    /// Which certificate errors the configuration bypasses
    pub cert_error_policy: Option<Arc<dyn CertErrorPolicy>>,

    /// Download nesting depth inherited from the request that spawned
    /// this job
    pub nesting_level: u32,
}

impl Default for HandshakeParams {
    fn default() -> Self {
        Self {
            negotiation_timeout: None,
            read_timeout: Duration::from_secs(15 * 60),
            use_cert_validator: true,
            validator: None,
            fetcher: None,
            cert_error_policy: None,
            nesting_level: 0,
        }
    }
}

/// What the completion callback receives: the connection back (open on
/// success, possibly closed on failure), the negotiated session, and
/// the error if there was one.
pub struct HandshakeAnswer<S> {
    /// The connection the job was driving
    pub conn: Connection,

    /// The negotiated session on success
    pub session: Option<S>,

    /// Why negotiation failed, if it did
    pub error: Option<HandshakeError>,
}

/// One outbound TLS negotiation job.
pub struct HandshakeDriver<S: TlsSession> {
    conn: Connection,
    domain: String,
    factory: Option<SessionFactory<S>>,
    completion: Completion<HandshakeAnswer<S>>,
    params: HandshakeParams,
    started: Instant,
    missing_cert_urls: VecDeque<String>,
    certs_downloads: u32,
}

impl<S: TlsSession> HandshakeDriver<S> {
    /// Create a job for `conn`, negotiating as a client for `domain`.
    pub fn new(
        conn: Connection,
        domain: impl Into<String>,
        factory: SessionFactory<S>,
        completion: Completion<HandshakeAnswer<S>>,
        params: HandshakeParams,
    ) -> Self {
        Self {
            conn,
            domain: domain.into(),
            factory: Some(factory),
            completion,
            params,
            started: Instant::now(),
            missing_cert_urls: VecDeque::new(),
            certs_downloads: 0,
        }
    }

    /// Run the job to completion on the current runtime.
    pub fn spawn(self) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::spawn(self.run())
    }

    /// Drive the handshake and deliver exactly one answer, unless the
    /// caller canceled.
    pub async fn run(mut self) {
        let result = self.drive().await;
        let HandshakeDriver {
            mut conn,
            completion,
            ..
        } = self;

        if completion.canceled() {
            // the caller is gone; finish cleanup without answering
            debug!(conn = %conn, "TLS negotiation canceled; closing connection");
            conn.close();
            return;
        }

        let answer = match result {
            Ok(session) => HandshakeAnswer {
                conn,
                session: Some(session),
                error: None,
            },
            Err(error) => HandshakeAnswer {
                conn,
                session: None,
                error: Some(error),
            },
        };
        if !completion.dispatch(answer) {
            debug!("TLS negotiation answer dropped; caller is gone");
        }
    }

    async fn drive(&mut self) -> Result<S, HandshakeError> {
        let mut session = self.prepare()?;
        loop {
            if !self.conn.is_open() {
                return Err(HandshakeError::SocketClosed);
            }
            if self.completion.canceled() {
                trace!("caller canceled mid-negotiation");
                return Err(HandshakeError::SocketClosed);
            }

            let step = session.drive_handshake();
            self.record_negotiation_details(&session);
            match step {
                HandshakeStep::Done => break,
                HandshakeStep::WantRead => self.note_want_read(&mut session).await?,
                HandshakeStep::WantWrite => self.wait_io(Interest::WRITABLE).await?,
                HandshakeStep::Failed(step_error) => {
                    return Err(self.negotiation_error(&mut session, step_error));
                }
            }
            // re-enter negotiation through the scheduler
            tokio::task::yield_now().await;
        }

        debug!(conn = %self.conn, domain = %self.domain, "TLS handshake complete");
        if let Some(validator) = self.validator_in_use() {
            self.validate(validator, &mut session).await?;
        }
        Ok(session)
    }

    /// Connection checks and session allocation; the INIT → PREPARED
    /// edge.
    fn prepare(&mut self) -> Result<S, HandshakeError> {
        if !self.conn.is_open() {
            debug!("connection gone before TLS negotiation started");
            return Err(HandshakeError::SocketClosed);
        }
        // peer-initiated closes surface as closed-readiness at every
        // suspension point below

        let Some(factory) = self.factory.take() else {
            unreachable!("prepare runs once per job")
        };
        let mut session = factory(&self.conn).map_err(|init| {
            warn!(conn = %self.conn, error = %init.reason, "error allocating TLS session");
            HandshakeError::SocketFailure { errno: init.errno }
        })?;

        // with no external validator, certificate errors are judged
        // in-handshake by the configured policy
        if self.validator_in_use().is_none() {
            if let Some(policy) = &self.params.cert_error_policy {
                session.install_error_policy(policy.clone());
            }
        }
        Ok(session)
    }

    fn validator_in_use(&self) -> Option<Arc<dyn CertValidator>> {
        if self.params.use_cert_validator {
            self.params.validator.clone()
        } else {
            None
        }
    }

    /// The library wants bytes. If the transport is holding reads for
    /// inspection and a ServerHello was captured, resolve the hold
    /// (fetching missing intermediates first) instead of waiting for
    /// the socket.
    async fn note_want_read(&mut self, session: &mut S) -> Result<(), HandshakeError> {
        if session.hold_read() {
            if session.saw_server_hello() {
                self.fetch_missing_certificates(session).await;
                session.release_read_hold();
                return Ok(()); // negotiation resumes on the held bytes
            }
            if session.hello_parse_failed() {
                warn!(conn = %self.conn, "error parsing TLS ServerHello");
                session.release_read_hold();
                return Ok(());
            }
        }
        self.wait_io(Interest::READABLE).await
    }

    /// The FETCHING_CERTS loop: download queued issuer URLs serially
    /// until the queue drains or a cap is hit.
    async fn fetch_missing_certificates(&mut self, session: &mut S) {
        if self.params.nesting_level >= MAX_NESTED_DOWNLOADS {
            debug!(
                nesting = self.params.nesting_level,
                "certificate download nesting too deep"
            );
            return;
        }
        let Some(fetcher) = self.params.fetcher.clone() else {
            return;
        };
        let chain = session.server_certificates();
        if chain.is_empty() {
            return;
        }
        debug!(conn = %self.conn, certs = chain.len(), "server sent certificate chain");
        for url in missing_issuer_urls(&chain) {
            self.enqueue_cert_url(url);
        }

        while self.certs_downloads < MAX_CERT_DOWNLOADS {
            let Some(url) = self.missing_cert_urls.pop_front() else {
                break;
            };
            debug!(%url, "downloading missing issuer certificate");
            let outcome = fetcher.fetch(&url, self.params.nesting_level + 1).await;
            self.certs_downloads += 1;
            debug!(
                %url,
                status = outcome.status,
                bytes = outcome.body.len(),
                "certificate download finished"
            );
            if let Some(cert) = session.decode_certificate(&outcome.body) {
                if let Some(next) = issuer_uri_if_missing(&cert, &chain) {
                    self.enqueue_cert_url(next);
                }
                session.add_untrusted_certificate(cert);
            }
        }
    }

    fn enqueue_cert_url(&mut self, url: String) {
        if !self.missing_cert_urls.contains(&url) {
            self.missing_cert_urls.push_back(url);
        }
    }

    /// Suspend until the socket is ready for `interest`, bounded by the
    /// negotiation deadline (and, for reads, the global read timeout).
    async fn wait_io(&mut self, interest: Interest) -> Result<(), HandshakeError> {
        let limit = if interest.is_readable() {
            Some(self.read_wait())
        } else {
            self.deadline_remaining()
        };
        let Some(socket) = self.conn.socket() else {
            return Err(HandshakeError::SocketClosed);
        };

        let ready = match limit {
            Some(limit) => tokio::time::timeout(limit, socket.ready(interest))
                .await
                .map_err(|_elapsed| {
                    debug!(conn = %self.conn, "TLS negotiation timed out");
                    HandshakeError::Timeout
                })?,
            None => socket.ready(interest).await,
        };
        let ready = ready.map_err(|io| HandshakeError::SocketFailure {
            errno: io.raw_os_error().unwrap_or(0),
        })?;

        // the close watch outranks the I/O watch
        if ready.is_read_closed() || ready.is_write_closed() {
            debug!(conn = %self.conn, "connection closed during TLS negotiation");
            return Err(HandshakeError::SocketClosed);
        }
        Ok(())
    }

    fn read_wait(&self) -> Duration {
        clamp_read_wait(
            self.params.read_timeout,
            self.params.negotiation_timeout,
            self.started.elapsed(),
        )
    }

    fn deadline_remaining(&self) -> Option<Duration> {
        self.params
            .negotiation_timeout
            .map(|deadline| deadline.saturating_sub(self.started.elapsed()))
    }

    /// Build the failure record for a failed handshake step.
    fn negotiation_error(&self, session: &mut S, step: StepError) -> HandshakeError {
        // the observed errno is meaningful only for a bare syscall
        // failure; everything else keeps the protocol-error default
        let syscall_errno = if step.class == StepErrorClass::Syscall
            && step.library_code == 0
            && step.ret == -1
        {
            step.errno
        } else {
            libc::EPROTO
        };

        let detail = session.take_error_detail();
        warn!(
            conn = %self.conn,
            io_code = step.io_code,
            library_code = step.library_code,
            ret = step.ret,
            "error negotiating TLS connection"
        );
        HandshakeError::Negotiation(HandshakeFailure {
            library_code: step.library_code,
            io_code: step.io_code,
            syscall_errno,
            broken_cert: detail.as_ref().and_then(|d| d.broken_cert.clone()),
            peer_cert: session.peer_certificate(),
            reason: detail.and_then(|d| d.reason),
        })
    }

    /// The VALIDATING state: submit the chain, suspend, judge the
    /// reply.
    async fn validate(
        &mut self,
        validator: Arc<dyn CertValidator>,
        session: &mut S,
    ) -> Result<(), HandshakeError> {
        let request = ValidationRequest {
            domain: self.domain.clone(),
            errors: session.accumulated_errors().unwrap_or_default(),
        };
        debug!(domain = %request.domain, "submitting certificate chain for validation");
        let reply = validator.validate(request).await;

        match reply.result {
            ValidationResult::Ok => Ok(()),
            ValidationResult::HelperFailure => {
                warn!(domain = %self.domain, "certificate validator failure");
                self.conn.close();
                Err(HandshakeError::ValidatorFailure)
            }
            ValidationResult::Error => {
                match self.check_validator_errors(session, &reply.errors) {
                    // the policy bypassed every reported error
                    None => Ok(()),
                    Some(detail) => {
                        self.conn.close();
                        Err(HandshakeError::CertificateErrors { detail })
                    }
                }
            }
        }
    }

    /// Walk the validator's errors. The first non-bypassed one becomes
    /// the honored detail; all of them (deduplicated) replace the
    /// session's error list.
    fn check_validator_errors(
        &self,
        session: &mut S,
        items: &[ValidatorErrorItem],
    ) -> Option<ErrorDetail> {
        let mut honored: Option<ErrorDetail> = None;
        let mut verdict: Vec<CertError> = Vec::new();

        for item in items {
            trace!(code = item.code, reason = %item.reason, "validator error item");
            debug_assert!(item.code != 0, "validator reported a non-error");

            let error = CertError {
                code: item.code,
                cert: item.cert.clone(),
                depth: item.depth,
            };

            if honored.is_none() {
                let bypassed = self
                    .params
                    .cert_error_policy
                    .as_ref()
                    .is_some_and(|policy| policy.allows(&error));
                if bypassed {
                    debug!(code = item.code, "bypassing certificate error");
                } else {
                    debug!(code = item.code, "confirming certificate error");
                    honored = Some(ErrorDetail {
                        code: item.code,
                        peer_cert: session.peer_certificate(),
                        broken_cert: item.cert.clone(),
                        reason: (!item.reason.is_empty()).then(|| item.reason.clone()),
                    });
                }
            }

            if !verdict
                .iter()
                .any(|seen| seen.code == error.code && seen.depth == error.depth)
            {
                verdict.push(error);
            }
        }

        if !verdict.is_empty() {
            session.replace_errors(verdict);
        }
        honored
    }

    /// Keep the connection's negotiation history current.
    fn record_negotiation_details(&mut self, session: &S) {
        let history = self.conn.tls_negotiations();
        if let Some(info) = session.negotiated() {
            history.protocol = Some(info.protocol);
            history.cipher = Some(info.cipher);
        }
        if session.saw_server_hello() {
            history.server_hello_seen = true;
        }
    }
}

/// Effective wait before a readable socket must deliver: the global
/// read timeout, clamped by what remains of the negotiation deadline.
pub(crate) fn clamp_read_wait(
    read_timeout: Duration,
    deadline: Option<Duration>,
    elapsed: Duration,
) -> Duration {
    match deadline {
        None => read_timeout,
        Some(deadline) => read_timeout.min(deadline.saturating_sub(elapsed)),
    }
}
