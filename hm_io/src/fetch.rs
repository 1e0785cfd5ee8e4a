//! Content-addressed fetch cache.
//!
//! `get` returns a local path holding the verified bytes of a resource.
//! Blobs are keyed by content hash, never by URL: two descriptors with the
//! same hash share one download, and a cached blob is returned without any
//! network access.
//!
//! Within one process, concurrent requests for the same key share a single
//! in-flight future, so at most one transfer per key happens at a time and
//! every waiter observes the same path or the same error. Distinct keys are
//! fetched independently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, warn};

use hm_core::{Error, InstallerConfig, ResourceDescriptor};

use crate::blob::{BlobCache, CacheEntry};
use crate::traits::Fetcher;

type InFlight = Shared<BoxFuture<'static, Result<PathBuf, Error>>>;

pub struct FetchCache {
    blobs: BlobCache,
    fetcher: Arc<dyn Fetcher>,
    config: Arc<InstallerConfig>,
    timeout: Duration,
    concurrency: usize,
    in_flight: Mutex<HashMap<String, InFlight>>,
    transfers: Arc<AtomicUsize>,
}

impl FetchCache {
    pub fn new(
        cache_root: &Path,
        fetcher: Arc<dyn Fetcher>,
        config: &InstallerConfig,
    ) -> Result<Self, Error> {
        let blobs = BlobCache::new(cache_root).map_err(|e| Error::InstallIo {
            resource: "cache".to_string(),
            message: format!("failed to create cache at {}: {e}", cache_root.display()),
        })?;

        Ok(Self {
            blobs,
            fetcher,
            config: Arc::new(config.clone()),
            timeout: config.fetch_timeout(),
            concurrency: config.fetch_concurrency.max(1),
            in_flight: Mutex::new(HashMap::new()),
            transfers: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }

    /// Number of network transfers attempted by this cache so far.
    pub fn fetch_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Return the path of the verified bytes for `descriptor`, fetching and
    /// verifying them first if they are not cached.
    ///
    /// Nothing is persisted unless verification succeeds.
    pub async fn get(&self, descriptor: &ResourceDescriptor) -> Result<PathBuf, Error> {
        let key = descriptor.cache_key();

        if self.blobs.has_blob(&key) {
            debug!(resource = %descriptor.name, key = %key, "fetch cache hit");
            return Ok(self.blobs.blob_path(&key));
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(resource = %descriptor.name, key = %key, "joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let job = FetchJob {
                        descriptor: descriptor.clone(),
                        key: key.clone(),
                        blobs: self.blobs.clone(),
                        fetcher: Arc::clone(&self.fetcher),
                        config: Arc::clone(&self.config),
                        timeout: self.timeout,
                        transfers: Arc::clone(&self.transfers),
                    };
                    let future = job.run().boxed().shared();
                    in_flight.insert(key.clone(), future.clone());
                    future
                }
            }
        };

        let result = shared.clone().await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            in_flight.remove(&key);
        }

        result
    }

    /// Fetch `descriptors` with at most `fetch_concurrency` transfers in
    /// flight, yielding results in input order.
    pub fn fetch_ordered<'a>(
        &'a self,
        descriptors: &'a [ResourceDescriptor],
    ) -> impl Stream<Item = Result<PathBuf, Error>> + 'a {
        stream::iter(descriptors)
            .map(move |descriptor| self.get(descriptor))
            .buffered(self.concurrency)
    }

    /// Fetch all `descriptors`, returning one result per descriptor in order.
    pub async fn fetch_all(&self, descriptors: &[ResourceDescriptor]) -> Vec<Result<PathBuf, Error>> {
        self.fetch_ordered(descriptors).collect().await
    }

    pub fn list(&self) -> Result<Vec<CacheEntry>, Error> {
        self.blobs.list().map_err(cache_io)
    }

    pub fn total_size(&self) -> Result<u64, Error> {
        self.blobs.total_size().map_err(cache_io)
    }

    /// Evict every entry. This is the only way entries leave the cache.
    pub fn clear(&self) -> Result<(usize, u64), Error> {
        let (count, bytes) = self.blobs.clear().map_err(cache_io)?;
        debug!(count, bytes, "fetch cache cleared");
        Ok((count, bytes))
    }

    pub fn cleanup_temp_files(&self) -> Result<(usize, u64), Error> {
        self.blobs.cleanup_temp_files().map_err(cache_io)
    }

    /// Re-hash every entry and return the keys whose bytes no longer match.
    pub fn audit(&self) -> Result<Vec<String>, Error> {
        let mut corrupt = Vec::new();
        for entry in self.list()? {
            let actual = hm_core::digest_file(&entry.path, hm_core::HashAlgorithm::Sha256)
                .map_err(cache_io)?;
            if !actual.eq_ignore_ascii_case(&entry.key) {
                warn!(key = %entry.key, actual = %actual, "cache entry does not match its key");
                corrupt.push(entry.key);
            }
        }
        Ok(corrupt)
    }
}

fn cache_io(e: std::io::Error) -> Error {
    Error::InstallIo {
        resource: "cache".to_string(),
        message: e.to_string(),
    }
}

/// One fetch-verify-persist attempt sequence for a single key.
struct FetchJob {
    descriptor: ResourceDescriptor,
    key: String,
    blobs: BlobCache,
    fetcher: Arc<dyn Fetcher>,
    config: Arc<InstallerConfig>,
    timeout: Duration,
    transfers: Arc<AtomicUsize>,
}

impl FetchJob {
    async fn run(self) -> Result<PathBuf, Error> {
        // Another job may have committed this key since the caller looked
        if self.blobs.has_blob(&self.key) {
            return Ok(self.blobs.blob_path(&self.key));
        }

        let mut attempt = 0;
        let bytes = loop {
            match self.fetch_once().await {
                Ok(bytes) => break bytes,
                Err(e) if e.is_retryable() && attempt < self.config.network_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff(attempt);
                    warn!(
                        resource = %self.descriptor.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        hm_core::verify(
            &self.descriptor.name,
            &bytes,
            &self.descriptor.content_hash,
            self.descriptor.hash_algorithm,
        )?;

        let blobs = self.blobs.clone();
        let key = self.key.clone();
        let path = tokio::task::spawn_blocking(move || blobs.put(&key, &bytes))
            .await
            .map_err(|e| Error::InstallIo {
                resource: self.descriptor.name.clone(),
                message: format!("cache write task failed: {e}"),
            })??;

        debug!(resource = %self.descriptor.name, path = %path.display(), "fetched and verified");
        Ok(path)
    }

    async fn fetch_once(&self) -> Result<Vec<u8>, Error> {
        let url = &self.descriptor.source_url;
        self.transfers.fetch_add(1, Ordering::SeqCst);
        debug!(resource = %self.descriptor.name, url = %url, "fetching");

        match tokio::time::timeout(self.timeout, self.fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("fetch {url}"),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockFetcher;
    use async_trait::async_trait;
    use hm_core::digest_hex;
    use hm_core::HashAlgorithm;
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        digest_hex(data, HashAlgorithm::Sha256)
    }

    fn fast_config() -> InstallerConfig {
        InstallerConfig {
            retry_backoff_ms: 1,
            fetch_timeout_secs: 5,
            ..Default::default()
        }
    }

    /// Fetcher that sleeps before answering and counts its calls.
    struct SlowFetcher {
        body: Vec<u8>,
        delay: Duration,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Fetcher for SlowFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(Error::NetworkFailure {
                    url: url.to_string(),
                    message: "connection reset".into(),
                })
            } else {
                Ok(self.body.clone())
            }
        }
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let tmp = TempDir::new().unwrap();
        let body = b"six-1.16.0 sdist".to_vec();
        let descriptor = ResourceDescriptor::new("six", "https://example.com/six.tar.gz", &sha(&body));

        let mut mock = MockFetcher::new();
        let served = body.clone();
        mock.expect_fetch()
            .times(1)
            .returning(move |_| Ok(served.clone()));

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        let first = cache.get(&descriptor).await.unwrap();
        let second = cache.get(&descriptor).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(std::fs::read(&first).unwrap(), body);
    }

    #[tokio::test]
    async fn same_hash_under_different_urls_downloads_once() {
        let tmp = TempDir::new().unwrap();
        let body = b"identical content".to_vec();
        let a = ResourceDescriptor::new("a", "https://mirror-a.example.com/x.tar.gz", &sha(&body));
        let b = ResourceDescriptor::new("b", "https://mirror-b.example.com/x.tar.gz", &sha(&body));

        let mut mock = MockFetcher::new();
        let served = body.clone();
        mock.expect_fetch()
            .times(1)
            .returning(move |_| Ok(served.clone()));

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        assert_eq!(cache.get(&a).await.unwrap(), cache.get(&b).await.unwrap());
    }

    #[tokio::test]
    async fn integrity_failure_persists_nothing_and_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let descriptor = ResourceDescriptor::new("libx", "https://example.com/libx.tar.gz", "deadbeef");

        let mut mock = MockFetcher::new();
        mock.expect_fetch()
            .times(1)
            .returning(|_| Ok(b"tampered".to_vec()));

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        let err = cache.get(&descriptor).await.unwrap_err();

        assert_eq!(
            err,
            Error::IntegrityFailure {
                resource: "libx".to_string(),
                expected: "deadbeef".to_string(),
                actual: sha(b"tampered"),
            }
        );
        assert!(cache.list().unwrap().is_empty());
        assert!(!cache.blobs().has_blob("deadbeef"));
    }

    #[tokio::test]
    async fn network_failure_is_retried_with_backoff() {
        let tmp = TempDir::new().unwrap();
        let body = b"eventually".to_vec();
        let descriptor = ResourceDescriptor::new("flaky", "https://example.com/flaky.tar.gz", &sha(&body));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let served = body.clone();
        let mut mock = MockFetcher::new();
        mock.expect_fetch().returning(move |url| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::NetworkFailure {
                    url: url.to_string(),
                    message: "HTTP 502".into(),
                })
            } else {
                Ok(served.clone())
            }
        });

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        cache.get(&descriptor).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.fetch_count(), 3);
    }

    #[tokio::test]
    async fn network_failure_surfaces_after_retries_exhausted() {
        let tmp = TempDir::new().unwrap();
        let descriptor = ResourceDescriptor::new("down", "https://example.com/down.tar.gz", "ab");

        let mut mock = MockFetcher::new();
        mock.expect_fetch().times(3).returning(|url| {
            Err(Error::NetworkFailure {
                url: url.to_string(),
                message: "HTTP 503".into(),
            })
        });

        let config = InstallerConfig {
            network_retries: 2,
            ..fast_config()
        };
        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &config).unwrap();
        let err = cache.get(&descriptor).await.unwrap_err();
        assert!(matches!(err, Error::NetworkFailure { .. }));
    }

    #[tokio::test]
    async fn hanging_fetch_times_out() {
        let tmp = TempDir::new().unwrap();
        let fetcher = SlowFetcher {
            body: Vec::new(),
            delay: Duration::from_secs(30),
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let descriptor = ResourceDescriptor::new("slow", "https://example.com/slow.tar.gz", "ab");

        let config = InstallerConfig {
            network_retries: 0,
            ..fast_config()
        };
        let mut cache = FetchCache::new(tmp.path(), Arc::new(fetcher), &config).unwrap();
        cache.timeout = Duration::from_millis(50);

        let err = cache.get(&descriptor).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { ref operation, .. } if operation.contains("slow.tar.gz")));
    }

    #[tokio::test]
    async fn concurrent_gets_for_one_key_share_one_transfer() {
        let tmp = TempDir::new().unwrap();
        let body = b"shared payload".to_vec();
        let fetcher = Arc::new(SlowFetcher {
            body: body.clone(),
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let descriptor = ResourceDescriptor::new("shared", "https://example.com/s.tar.gz", &sha(&body));

        let cache = FetchCache::new(tmp.path(), fetcher.clone(), &fast_config()).unwrap();
        let results = futures::future::join_all((0..8).map(|_| cache.get(&descriptor))).await;

        let paths: Vec<PathBuf> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_receive_the_same_error() {
        let tmp = TempDir::new().unwrap();
        let fetcher = Arc::new(SlowFetcher {
            body: Vec::new(),
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let descriptor = ResourceDescriptor::new("down", "https://example.com/d.tar.gz", "ab");

        let config = InstallerConfig {
            network_retries: 0,
            ..fast_config()
        };
        let cache = FetchCache::new(tmp.path(), fetcher.clone(), &config).unwrap();
        let results = futures::future::join_all((0..4).map(|_| cache.get(&descriptor))).await;

        let errors: Vec<Error> = results.into_iter().map(|r| r.unwrap_err()).collect();
        assert!(errors.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_all_preserves_input_order() {
        let tmp = TempDir::new().unwrap();
        let bodies: Vec<Vec<u8>> = (0..5).map(|i| format!("payload {i}").into_bytes()).collect();
        let descriptors: Vec<ResourceDescriptor> = bodies
            .iter()
            .enumerate()
            .map(|(i, b)| {
                ResourceDescriptor::new(&format!("r{i}"), &format!("https://example.com/r{i}"), &sha(b))
            })
            .collect();

        let served = bodies.clone();
        let mut mock = MockFetcher::new();
        mock.expect_fetch().returning(move |url| {
            let i: usize = url.trim_start_matches("https://example.com/r").parse().unwrap();
            Ok(served[i].clone())
        });

        let config = InstallerConfig {
            fetch_concurrency: 2,
            ..fast_config()
        };
        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &config).unwrap();
        let results = cache.fetch_all(&descriptors).await;

        for (result, body) in results.into_iter().zip(&bodies) {
            assert_eq!(&std::fs::read(result.unwrap()).unwrap(), body);
        }
    }

    /// Fetcher that tracks how many of its calls overlap.
    #[derive(Default)]
    struct OverlapFetcher {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for OverlapFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(url.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn fetch_all_never_exceeds_configured_concurrency() {
        let tmp = TempDir::new().unwrap();
        let descriptors: Vec<ResourceDescriptor> = (0..6)
            .map(|i| {
                let url = format!("https://example.com/r{i}");
                ResourceDescriptor::new(&format!("r{i}"), &url, &sha(url.as_bytes()))
            })
            .collect();

        let fetcher = Arc::new(OverlapFetcher::default());
        let config = InstallerConfig {
            fetch_concurrency: 2,
            ..fast_config()
        };
        let cache = FetchCache::new(tmp.path(), fetcher.clone(), &config).unwrap();
        let results = cache.fetch_all(&descriptors).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_evicts_and_forces_refetch() {
        let tmp = TempDir::new().unwrap();
        let body = b"refetch me".to_vec();
        let descriptor = ResourceDescriptor::new("r", "https://example.com/r", &sha(&body));

        let served = body.clone();
        let mut mock = MockFetcher::new();
        mock.expect_fetch()
            .times(2)
            .returning(move |_| Ok(served.clone()));

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        cache.get(&descriptor).await.unwrap();
        let (count, _) = cache.clear().unwrap();
        assert_eq!(count, 1);
        cache.get(&descriptor).await.unwrap();
    }

    #[tokio::test]
    async fn audit_flags_tampered_entries() {
        let tmp = TempDir::new().unwrap();
        let body = b"good bytes".to_vec();
        let descriptor = ResourceDescriptor::new("r", "https://example.com/r", &sha(&body));

        let served = body.clone();
        let mut mock = MockFetcher::new();
        mock.expect_fetch().returning(move |_| Ok(served.clone()));

        let cache = FetchCache::new(tmp.path(), Arc::new(mock), &fast_config()).unwrap();
        let path = cache.get(&descriptor).await.unwrap();
        assert!(cache.audit().unwrap().is_empty());

        std::fs::write(&path, b"bad bytes").unwrap();
        assert_eq!(cache.audit().unwrap(), vec![sha(&body)]);
    }
}
