//! Remote byte source abstraction.
//!
//! The engine only ever issues plain GET requests: manifests and chunks are
//! both opaque byte blobs behind a URL prefix. The trait keeps the transport
//! injectable so tests can serve builds from memory, and uses boxed futures
//! to stay dyn-compatible (`Arc<dyn RemoteSource>`).
//!
//! There is deliberately no retry layer here: a corrupt or failed chunk is
//! caught by the verifier and repaired in a second pass, so the transport
//! stays single-shot.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt;

use crate::error::{EngineError, EngineResult};

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default timeout for HTTP requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// User agent sent with every request; some CDN edges reject anonymous
/// clients.
const USER_AGENT: &str = concat!("chunkmill/", env!("CARGO_PKG_VERSION"));

/// Source of manifest and chunk bytes.
pub trait RemoteSource: Send + Sync {
    /// GET `url` and return the full response body.
    ///
    /// Implementations must fail with [`EngineError::RemoteStatus`] on a
    /// non-success status code so the caller can distinguish a missing blob
    /// from a transport fault.
    fn fetch(&self, url: &str) -> BoxFuture<'_, EngineResult<Vec<u8>>>;
}

/// HTTP implementation of [`RemoteSource`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpRemoteSource {
    client: reqwest::Client,
}

impl HttpRemoteSource {
    /// Create a source with the default timeout.
    pub fn new() -> EngineResult<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a source with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| EngineError::Remote {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

impl RemoteSource for HttpRemoteSource {
    fn fetch(&self, url: &str) -> BoxFuture<'_, EngineResult<Vec<u8>>> {
        let url = url.to_string();
        Box::pin(async move {
            let response =
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| EngineError::Remote {
                        url: url.clone(),
                        reason: e.to_string(),
                    })?;

            let status = response.status();
            if !status.is_success() {
                return Err(EngineError::RemoteStatus {
                    url,
                    status: status.as_u16(),
                });
            }

            // Content-Length is used only as a capacity hint; the body is
            // authoritative.
            let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
            let mut stream = response.bytes_stream();
            while let Some(piece) = stream.next().await {
                let piece = piece.map_err(|e| EngineError::Remote {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;
                body.extend_from_slice(&piece);
            }
            Ok(body)
        })
    }
}
