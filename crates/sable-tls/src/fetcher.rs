//! The certificate downloader seam
//!
//! Missing intermediates are fetched over plain HTTP from the URL the
//! AIA extension names. The downloader is a collaborator; the driver
//! only bounds how many downloads one connection may trigger and how
//! deep download-triggers-download nesting may go.

use async_trait::async_trait;

/// What one download produced.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Response body; parsed as DER regardless of status
    pub body: Vec<u8>,

    /// HTTP status code, for logging
    pub status: u16,
}

/// Asynchronous HTTP downloader for certificate fetching.
#[async_trait]
pub trait CertFetcher: Send + Sync {
    /// Fetch `url`. `nesting` is the depth of download-triggered
    /// downloads, starting at 1 for a fetch triggered by a regular
    /// request.
    async fn fetch(&self, url: &str, nesting: u32) -> FetchOutcome;
}
