//! Installer configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! The CLI loads an optional file and then applies its own flags on top.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::Error;

/// A build backend expressed as a command run inside the source tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory, relative to the source tree, the artifact is written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl BackendCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "dist".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallerConfig {
    /// Maximum number of fetches in flight at once.
    pub fetch_concurrency: usize,
    pub fetch_timeout_secs: u64,
    /// Extra attempts for a fetch that failed with a network error.
    pub network_retries: u32,
    pub retry_backoff_ms: u64,
    pub build_timeout_secs: u64,
    pub smoke_timeout_secs: u64,
    /// Additional or overriding build backends, keyed by backend id.
    pub backends: BTreeMap<String, BackendCommand>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 8,
            fetch_timeout_secs: 300,
            network_retries: 3,
            retry_backoff_ms: 500,
            build_timeout_secs: 1800,
            smoke_timeout_secs: 30,
            backends: BTreeMap::new(),
        }
    }
}

impl InstallerConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: InstallerConfig = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("invalid config: {e}")))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<(), Error> {
        if self.fetch_concurrency == 0 {
            return Err(Error::validation("fetch_concurrency must be at least 1"));
        }
        for (id, backend) in &self.backends {
            if backend.program.trim().is_empty() {
                return Err(Error::validation(format!(
                    "backend '{id}' has an empty program"
                )));
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn smoke_timeout(&self) -> Duration {
        Duration::from_secs(self.smoke_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based): doubles each time.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
