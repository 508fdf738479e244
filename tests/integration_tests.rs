// Integration tests for cross-crate interactions.
//
// Exercises the flows the forwarding engine strings together: path
// selection feeding connection attempts, a miss collapsing across
// workers, and a TLS negotiation driven over a real socket pair.

use std::sync::Arc;
use std::time::Duration;

use sable::collapse::{
    CacheKey, CollapseEntry, CollapseError, CollapseSegment, IoRole, Method, RequestFlags,
    TransientReach, Transients,
};
use sable::core::config::{CollapseConfig, ForwardConfig};
use sable::core::connection::Connection;
use sable::core::paths::PathBook;
use sable::core::peer::CachePeer;
use sable::tls::{
    CertError, CertErrorPolicy, CertValidator, Certificate, ErrorDetail, HandshakeAnswer,
    HandshakeDriver, HandshakeParams, HandshakeStep, NegotiatedInfo, TlsSession, ValidationReply,
    ValidationRequest, ValidationResult, completion_channel,
};
use tokio::net::{TcpListener, TcpStream};

// ============================================================================
// Helpers
// ============================================================================

fn candidate(remote: &str, peer: Option<&Arc<CachePeer>>) -> Connection {
    let remote: std::net::SocketAddr = remote.parse().unwrap();
    let local = if remote.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let mut conn = Connection::new();
    conn.set_addrs(local, remote);
    conn.set_peer(peer);
    conn
}

fn miss_entry(url: &str) -> Arc<CollapseEntry> {
    Arc::new(CollapseEntry::new(
        CacheKey::from_parts(Method::Get, url),
        url,
        Method::Get,
        RequestFlags {
            collapsible: true,
            cachable: true,
        },
    ))
}

// ============================================================================
// Path selection over real attempts
// ============================================================================

/// A full selection round: try the prime, race the spare, lose both,
/// retry, and finally succeed on the returned path.
#[test]
fn test_selection_round_with_retries() {
    let cfg = ForwardConfig::default();
    assert!(cfg.validate().is_ok());

    let peer = Arc::new(CachePeer::new("parent", "parent.example.net"));
    let mut book = PathBook::with_capacity_hint(cfg.forward_max_tries);
    book.add(candidate("192.0.2.1:3128", Some(&peer)));
    book.add(candidate("[2001:db8::1]:3128", Some(&peer)));
    book.finalize();

    let prime = book.extract_front();
    let spare = book.extract_spare(&prime.connection).unwrap();
    assert!(book.empty());
    assert!(book.done_with_peer(&prime.connection));

    // both attempts fail; the engine returns them and starts over
    book.retry_path(spare);
    book.retry_path(prime);
    assert_eq!(book.size(), 2);

    let again = book.extract_front();
    assert_eq!(again.connection.remote().to_string(), "192.0.2.1:3128");
}

// ============================================================================
// Collapsed forwarding across workers
// ============================================================================

/// The collision scenario end to end: two workers race to write, a
/// third reads, completion shuts the door on a fourth.
#[test]
fn test_collapse_collision_lifecycle() {
    let segment = CollapseSegment::new(&CollapseConfig {
        collapsed_forwarding: true,
        shared_entries_limit: 64,
    })
    .unwrap();

    let worker1 = Transients::attach(Some(segment.clone()));
    let worker2 = Transients::attach(Some(segment.clone()));
    let worker3 = Transients::attach(Some(segment.clone()));
    let worker4 = Transients::attach(Some(segment.clone()));

    let url = "http://origin.example.com/article";
    let entry1 = miss_entry(url);
    let entry2 = miss_entry(url);

    // exactly one writer wins
    worker1.start_writing(&entry1).unwrap();
    assert!(matches!(
        worker2.start_writing(&entry2),
        Err(CollapseError::Collision)
    ));

    // a late request on another worker attaches as reader with the
    // writer's metadata
    let attached = worker3.get(&entry1.key()).unwrap();
    assert_eq!(attached.io_role(), IoRole::Reading);
    assert_eq!(attached.url(), url);

    // after completion no new reader may join
    worker1.complete_writing(&entry1);
    assert!(worker4.get(&attached.key()).is_none());

    // the capability surface agrees
    assert!(worker4.find(&attached.key()).is_none());

    worker3.disconnect(&attached);
    assert_eq!(segment.entry_count(), 0);
}

/// Eviction through the narrow storage capability wakes a monitoring
/// worker.
#[test]
fn test_eviction_reaches_monitor() {
    let segment = CollapseSegment::new(&CollapseConfig {
        collapsed_forwarding: true,
        shared_entries_limit: 8,
    })
    .unwrap();

    let serving = Transients::attach(Some(segment.clone()));
    let deleting = Transients::attach(Some(segment.clone()));

    let entry = miss_entry("http://origin.example.com/volatile");
    serving.monitor_while_reading(&entry).unwrap();

    let mut notices = segment.subscribe();
    deleting.evict(&entry.key());

    assert_eq!(notices.try_recv().unwrap().key, entry.key());
    assert!(serving.status(&entry).waiting_to_be_freed);
}

// ============================================================================
// TLS negotiation over a socket pair
// ============================================================================

struct OneShotSession;

impl TlsSession for OneShotSession {
    fn drive_handshake(&mut self) -> HandshakeStep {
        HandshakeStep::Done
    }
    fn hold_read(&self) -> bool {
        false
    }
    fn release_read_hold(&mut self) {}
    fn saw_server_hello(&self) -> bool {
        true
    }
    fn hello_parse_failed(&self) -> bool {
        false
    }
    fn server_certificates(&self) -> Vec<Certificate> {
        Vec::new()
    }
    fn add_untrusted_certificate(&mut self, _cert: Certificate) {}
    fn decode_certificate(&self, _der: &[u8]) -> Option<Certificate> {
        None
    }
    fn peer_certificate(&self) -> Option<Certificate> {
        None
    }
    fn accumulated_errors(&self) -> Option<Vec<CertError>> {
        None
    }
    fn replace_errors(&mut self, _errors: Vec<CertError>) {}
    fn take_error_detail(&mut self) -> Option<ErrorDetail> {
        None
    }
    fn install_error_policy(&mut self, _policy: Arc<dyn CertErrorPolicy>) {}
    fn negotiated(&self) -> Option<NegotiatedInfo> {
        Some(NegotiatedInfo {
            protocol: "TLSv1.3".to_string(),
            cipher: "TLS_CHACHA20_POLY1305_SHA256".to_string(),
        })
    }
}

/// A validator that accepts everything and remembers the domain it was
/// asked about.
struct RecordingValidator {
    domains: std::sync::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl CertValidator for RecordingValidator {
    async fn validate(&self, request: ValidationRequest) -> ValidationReply {
        self.domains.lock().unwrap().push(request.domain);
        ValidationReply {
            result: ValidationResult::Ok,
            errors: Vec::new(),
        }
    }
}

/// A path extracted from the book is opened, negotiated through the
/// external validator, and comes back open with its history filled in.
#[tokio::test]
async fn test_negotiate_on_extracted_path() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();

    let mut book = PathBook::new();
    book.add(candidate(&origin.to_string(), None));
    book.finalize();

    let mut extracted = book.extract_front();
    let socket = TcpStream::connect(extracted.connection.remote())
        .await
        .unwrap();
    extracted.connection.adopt_socket(socket);
    let (_server, _) = listener.accept().await.unwrap();

    let validator = Arc::new(RecordingValidator {
        domains: std::sync::Mutex::new(Vec::new()),
    });

    let (completion, _handle, rx) = completion_channel::<HandshakeAnswer<OneShotSession>>();
    let driver = HandshakeDriver::new(
        extracted.connection,
        "origin.example.com",
        Box::new(|_conn| Ok(OneShotSession)),
        completion,
        HandshakeParams {
            negotiation_timeout: Some(Duration::from_secs(10)),
            validator: Some(validator.clone()),
            ..HandshakeParams::default()
        },
    );
    driver.spawn().await.unwrap();

    let answer = rx.await.unwrap();
    assert!(answer.error.is_none());
    assert!(answer.conn.is_open());
    assert_eq!(
        answer.conn.tls_history().unwrap().protocol.as_deref(),
        Some("TLSv1.3")
    );
    assert_eq!(
        validator.domains.lock().unwrap().as_slice(),
        ["origin.example.com".to_string()]
    );
}
