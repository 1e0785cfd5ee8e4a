//! Test utilities for hermit.
//!
//! - `TestContext` wraps a TempDir, a wiremock `MockServer` and an
//!   `Installer` wired to both
//! - fixture builders for tarballs, primary package sources and manifests
//! - response helpers for simulating network failures
//!
//! # Example
//!
//! ```ignore
//! use hm_io::test_utils::{TestContext, tool_manifest};
//!
//! #[tokio::test]
//! async fn installs_tool() {
//!     let ctx = TestContext::new().await;
//!     let primary = ctx.mount_tool_source("tool").await;
//!     let manifest = tool_manifest(primary, vec![], &["tool"]);
//!
//!     let env = ctx.installer().install(&manifest, &ctx.env_root("e")).await.unwrap();
//!     assert!(env.bin_dir().join("tool").exists());
//! }
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hm_core::{HashAlgorithm, InstallerConfig, Manifest, PrimaryPackage, ResourceDescriptor};

use crate::build::CommandBackend;
use crate::fetch::FetchCache;
use crate::install::Installer;
use crate::traits::HttpFetcher;

// ============================================================================
// Fixtures
// ============================================================================

/// Compute SHA256 hex digest of data.
pub fn sha256_hex(data: &[u8]) -> String {
    hm_core::digest_hex(data, HashAlgorithm::Sha256)
}

/// Gzipped tarball from `(path, content, mode)` entries.
pub fn tarball(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (rel_path, content, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(rel_path).unwrap();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append(&header, *content).unwrap();
    }

    let tar_data = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_data).unwrap();
    encoder.finish().unwrap()
}

/// Source tarball for a primary package whose `sh` build writes one
/// executable, `dist/<entry_point>`, that prints a version line.
pub fn tool_source_tarball(entry_point: &str) -> Vec<u8> {
    let script = format!(
        "mkdir -p dist\n\
         cat > dist/{entry_point} <<'EOF'\n\
         #!/bin/sh\n\
         echo \"{entry_point} 1.0\"\n\
         EOF\n\
         chmod +x dist/{entry_point}\n"
    );
    tarball(&[(
        &format!("{entry_point}-1.0/build.sh"),
        script.as_bytes(),
        0o644,
    )])
}

/// Resource tarball that ships a post-install hook running `script`.
pub fn hooked_resource_tarball(name: &str, script: &str) -> Vec<u8> {
    let hook = format!("#!/bin/sh\nset -e\n{script}\n");
    tarball(&[
        (&format!("{name}-1.0/{name}.txt"), name.as_bytes(), 0o644),
        (
            &format!("{name}-1.0/{}", crate::environment::POSTINSTALL_HOOK),
            hook.as_bytes(),
            0o755,
        ),
    ])
}

/// Manifest named `tool` built with the `sh` backend.
pub fn tool_manifest(
    primary: PrimaryPackage,
    resources: Vec<ResourceDescriptor>,
    entry_points: &[&str],
) -> Manifest {
    Manifest {
        name: Some("tool".to_string()),
        version: Some("1.0".to_string()),
        primary_package: Some(primary),
        resources,
        build_backend: "sh".to_string(),
        entry_points: entry_points.iter().map(|s| s.to_string()).collect(),
        smoke_test: None,
    }
}

/// Installer settings that keep failing tests fast.
pub fn fast_config() -> InstallerConfig {
    InstallerConfig {
        fetch_concurrency: 4,
        fetch_timeout_secs: 5,
        network_retries: 1,
        retry_backoff_ms: 10,
        build_timeout_secs: 30,
        smoke_timeout_secs: 10,
        ..Default::default()
    }
}

// ============================================================================
// Network failure helpers
// ============================================================================

pub fn mock_500_error(message: Option<&str>) -> ResponseTemplate {
    let mut response = ResponseTemplate::new(500);
    if let Some(msg) = message {
        response = response.set_body_string(msg);
    }
    response
}

// ============================================================================
// TestContext
// ============================================================================

/// Self-contained installer setup backed by a mock HTTP server.
pub struct TestContext {
    tmp: TempDir,
    server: MockServer,
    installer: Installer,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    pub async fn with_config(config: InstallerConfig) -> Self {
        let tmp = TempDir::new().unwrap();
        let server = MockServer::start().await;

        let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout()));
        let cache = FetchCache::new(&tmp.path().join("cache"), fetcher, &config).unwrap();
        let backend = Arc::new(CommandBackend::from_config(&config));
        let installer = Installer::new(Arc::new(cache), backend, config);

        Self {
            tmp,
            server,
            installer,
        }
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.tmp.path().join("cache")
    }

    /// A path for a new environment; not created.
    pub fn env_root(&self, name: &str) -> PathBuf {
        self.tmp.path().join("envs").join(name)
    }

    /// Serve `bytes` at `/files/<file_name>` and describe it as resource `name`.
    pub async fn mount_payload(&self, name: &str, file_name: &str, bytes: &[u8]) -> ResourceDescriptor {
        let url_path = format!("/files/{file_name}");
        Mock::given(method("GET"))
            .and(path(url_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()))
            .mount(&self.server)
            .await;

        ResourceDescriptor::new(
            name,
            &format!("{}{url_path}", self.server.uri()),
            &sha256_hex(bytes),
        )
    }

    /// Serve a buildable source package for `entry_point` and return it as
    /// a primary package.
    pub async fn mount_tool_source(&self, entry_point: &str) -> PrimaryPackage {
        let bytes = tool_source_tarball(entry_point);
        let descriptor = self
            .mount_payload(entry_point, &format!("{entry_point}-1.0.tar.gz"), &bytes)
            .await;
        PrimaryPackage {
            source_url: descriptor.source_url,
            content_hash: descriptor.content_hash,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }

    /// Serve `response` at `/files/<file_name>`, returning the URL.
    pub async fn mount_response(&self, file_name: &str, response: ResponseTemplate) -> String {
        let url_path = format!("/files/{file_name}");
        Mock::given(method("GET"))
            .and(path(url_path.as_str()))
            .respond_with(response)
            .mount(&self.server)
            .await;
        format!("{}{url_path}", self.server.uri())
    }

    /// Write `manifest` as JSON into the temp dir and return its path.
    pub fn write_manifest(&self, manifest: &Manifest) -> PathBuf {
        let path = self.tmp.path().join("manifest.json");
        std::fs::write(&path, serde_json::to_string_pretty(manifest).unwrap()).unwrap();
        path
    }
}
