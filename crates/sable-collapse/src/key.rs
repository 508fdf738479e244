//! Cache keys and the request metadata shared through transient slots.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// HTTP request method, as far as the transient index cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
}

impl Method {
    /// Canonical method token.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request flags that readers of a transient entry inherit from its
/// writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Whether this request may join an in-flight fetch for its key
    pub collapsible: bool,

    /// Whether the response may be shared with other clients
    pub cachable: bool,
}

/// Opaque fixed-width hash identifying a cachable response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Derive the key for a request.
    #[must_use]
    pub fn from_parts(method: Method, url: &str) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&half_hash(0x5ab1e, method, url).to_be_bytes());
        bytes[8..].copy_from_slice(&half_hash(0xc0ffee, method, url).to_be_bytes());
        Self(bytes)
    }

    /// Wrap an externally computed digest.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

fn half_hash(salt: u64, method: Method, url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    salt.hash(&mut hasher);
    method.hash(&mut hasher);
    url.hash(&mut hasher);
    hasher.finish()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_stable() {
        let a = CacheKey::from_parts(Method::Get, "http://example.com/");
        let b = CacheKey::from_parts(Method::Get, "http://example.com/");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_varies_with_method_and_url() {
        let get = CacheKey::from_parts(Method::Get, "http://example.com/");
        let head = CacheKey::from_parts(Method::Head, "http://example.com/");
        let other = CacheKey::from_parts(Method::Get, "http://example.com/other");
        assert_ne!(get, head);
        assert_ne!(get, other);
    }

    #[test]
    fn test_display_is_short_hex() {
        let key = CacheKey::from_bytes([0xab; 16]);
        assert_eq!(key.to_string(), "abababababababab");
    }
}
