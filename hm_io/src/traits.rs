//! Trait abstractions for the installer's external collaborators.
//!
//! The network transport and the build backend are injected into the
//! installer through these traits, so tests can substitute mocks that
//! return fixed bytes, fail, or hang.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use hm_core::Error;

/// The fetch primitive: resolve a URL to its bytes.
///
/// Implementations only transport bytes; integrity is checked by the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error>;
}

/// A build backend: turn a staged source tree into one installable artifact.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Whether `backend_id` names a backend this implementation can run.
    fn supports(&self, backend_id: &str) -> bool;

    async fn build(&self, source_dir: &Path, backend_id: &str) -> Result<PathBuf, Error>;
}

/// Fetcher for `http(s)://` URLs via reqwest, plus local `file://` URLs.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("hermit/", env!("CARGO_PKG_VERSION")))
                .pool_max_idle_per_host(10)
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .map_err(|e| Error::NetworkFailure {
                    url: url.to_string(),
                    message: e.to_string(),
                });
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::NetworkFailure {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::NetworkFailure {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::NetworkFailure {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}
