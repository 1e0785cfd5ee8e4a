//! Pinned install manifests.
//!
//! A manifest is the complete, already-resolved input to one install run:
//! the primary package to build, every resource it needs (in the order they
//! must be installed), the build backend to use, and the entry points to
//! expose. Nothing here is inferred; the loader hands over a fixed set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::Error;

/// Name used for the primary package when the manifest does not name it.
pub const DEFAULT_PRIMARY_NAME: &str = "primary";

/// Arguments passed to the entry point when the manifest has no smoke test block.
pub const DEFAULT_SMOKE_ARGS: &[&str] = &["--help"];

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+-]*$").expect("valid regex"));

static HEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]+$").expect("valid regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(Error::validation(format!(
                "unsupported hash algorithm '{other}'"
            ))),
        }
    }
}

/// A single pinned, content-addressed dependency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(alias = "url")]
    pub source_url: String,
    #[serde(alias = "sha256")]
    pub content_hash: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

impl ResourceDescriptor {
    pub fn new(name: &str, source_url: &str, content_hash: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            source_url: source_url.to_string(),
            content_hash: content_hash.to_string(),
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Cache key for this resource's bytes: the normalized content hash.
    pub fn cache_key(&self) -> String {
        self.content_hash.to_ascii_lowercase()
    }

    /// `name` or `name version` for messages.
    pub fn label(&self) -> String {
        match &self.version {
            Some(v) => format!("{} {}", self.name, v),
            None => self.name.clone(),
        }
    }
}

/// The package whose source is built into the installed tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryPackage {
    #[serde(alias = "url")]
    pub source_url: String,
    #[serde(alias = "sha256")]
    pub content_hash: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

/// Post-install sanity check: which entry point to run and with what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SmokeTest {
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Manifest {
    /// Name of the primary package; also its namespace in the environment.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub primary_package: Option<PrimaryPackage>,
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub build_backend: String,
    #[serde(default)]
    pub entry_points: BTreeSet<String>,
    #[serde(default)]
    pub smoke_test: Option<SmokeTest>,
}

impl Manifest {
    /// Parse a manifest from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("failed to parse manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn primary_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_PRIMARY_NAME)
    }

    /// The primary package as a descriptor, so it flows through the same
    /// fetch, verify and install path as every other resource.
    pub fn primary_descriptor(&self) -> Result<ResourceDescriptor, Error> {
        let primary = self
            .primary_package
            .as_ref()
            .ok_or_else(|| Error::validation("primary package is missing"))?;

        Ok(ResourceDescriptor {
            name: self.primary_name().to_string(),
            version: self.version.clone(),
            source_url: primary.source_url.clone(),
            content_hash: primary.content_hash.clone(),
            hash_algorithm: primary.hash_algorithm,
        })
    }

    /// Entry point and arguments for the post-install smoke test.
    ///
    /// Returns `None` when there is nothing to run.
    pub fn smoke_test_command(&self) -> Option<(String, Vec<String>)> {
        let smoke = self.smoke_test.clone().unwrap_or_default();
        let entry_point = smoke
            .entry_point
            .or_else(|| self.entry_points.iter().next().cloned())?;
        let args = if smoke.args.is_empty() {
            DEFAULT_SMOKE_ARGS.iter().map(|s| s.to_string()).collect()
        } else {
            smoke.args
        };
        Some((entry_point, args))
    }

    /// Check the structural invariants the installer relies on.
    ///
    /// Does not check the build backend id; only the installer knows which
    /// backends are available.
    pub fn validate(&self) -> Result<(), Error> {
        let primary = self.primary_descriptor()?;
        validate_descriptor(&primary, "primary package")?;

        if self.build_backend.trim().is_empty() {
            return Err(Error::validation("build backend is not set"));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(self.primary_name());

        for resource in &self.resources {
            validate_descriptor(resource, "resource")?;
            if !seen.insert(resource.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate resource name '{}'",
                    resource.name
                )));
            }
        }

        for entry_point in &self.entry_points {
            if !is_valid_name(entry_point) {
                return Err(Error::validation(format!(
                    "invalid entry point name '{entry_point}'"
                )));
            }
        }

        if let Some(smoke) = &self.smoke_test
            && let Some(entry_point) = &smoke.entry_point
            && !self.entry_points.contains(entry_point)
        {
            return Err(Error::validation(format!(
                "smoke test entry point '{entry_point}' is not a declared entry point"
            )));
        }

        Ok(())
    }
}

/// Names become directory and file names inside the environment, so they
/// must be a single, non-hidden path component.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name) && name != "." && name != ".."
}

fn validate_descriptor(descriptor: &ResourceDescriptor, what: &str) -> Result<(), Error> {
    if !is_valid_name(&descriptor.name) {
        return Err(Error::validation(format!(
            "invalid {what} name '{}'",
            descriptor.name
        )));
    }
    if descriptor.source_url.trim().is_empty() {
        return Err(Error::validation(format!(
            "{what} '{}' has no source url",
            descriptor.name
        )));
    }
    if !HEX_RE.is_match(&descriptor.content_hash) {
        return Err(Error::validation(format!(
            "{what} '{}' has an invalid content hash '{}'",
            descriptor.name, descriptor.content_hash
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "96c440b89c364b661f66ef96d09858d5d88d9eb89b35af55eae712e4df3180b5";

    fn manifest() -> Manifest {
        Manifest {
            name: Some("upsolver-cli".to_string()),
            version: Some("0.1.0".to_string()),
            primary_package: Some(PrimaryPackage {
                source_url: "https://example.com/cli-0.1.0.tar.gz".to_string(),
                content_hash: HASH.to_string(),
                hash_algorithm: HashAlgorithm::Sha256,
            }),
            resources: vec![
                ResourceDescriptor::new("six", "https://example.com/six.tar.gz", "aa11"),
                ResourceDescriptor::new("click", "https://example.com/click.tar.gz", "bb22"),
            ],
            build_backend: "poetry".to_string(),
            entry_points: ["upsolver".to_string()].into_iter().collect(),
            smoke_test: None,
        }
    }

    #[test]
    fn valid_manifest_passes() {
        manifest().validate().unwrap();
    }

    #[test]
    fn duplicate_resource_name_is_rejected() {
        let mut m = manifest();
        m.resources
            .push(ResourceDescriptor::new("six", "https://example.com/six2.tar.gz", "cc33"));

        let err = m.validate().unwrap_err();
        assert!(matches!(err, Error::Validation { ref message } if message.contains("six")));
    }

    #[test]
    fn resource_named_like_primary_is_rejected() {
        let mut m = manifest();
        m.resources.push(ResourceDescriptor::new(
            "upsolver-cli",
            "https://example.com/x.tar.gz",
            "dd44",
        ));

        assert!(m.validate().is_err());
    }

    #[test]
    fn missing_primary_package_is_rejected() {
        let mut m = manifest();
        m.primary_package = None;

        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("primary package"));
    }

    #[test]
    fn path_like_names_are_rejected() {
        for bad in ["../etc", ".hidden", "a/b", ""] {
            let mut m = manifest();
            m.resources[0].name = bad.to_string();
            assert!(m.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn non_hex_hash_is_rejected() {
        let mut m = manifest();
        m.resources[1].content_hash = "not-a-hash".to_string();
        assert!(m.validate().is_err());
    }

    #[test]
    fn missing_backend_is_rejected() {
        let mut m = manifest();
        m.build_backend = "  ".to_string();
        assert!(m.validate().is_err());
    }

    #[test]
    fn smoke_test_defaults_to_first_entry_point_with_help() {
        let (entry, args) = manifest().smoke_test_command().unwrap();
        assert_eq!(entry, "upsolver");
        assert_eq!(args, vec!["--help".to_string()]);
    }

    #[test]
    fn smoke_test_entry_point_must_be_declared() {
        let mut m = manifest();
        m.smoke_test = Some(SmokeTest {
            entry_point: Some("other".to_string()),
            args: vec!["--version".to_string()],
        });
        assert!(m.validate().is_err());
    }

    #[test]
    fn from_json_accepts_url_and_sha256_aliases() {
        let json = format!(
            r#"{{
                "name": "tool",
                "primary_package": {{ "url": "https://example.com/tool.tar.gz", "sha256": "{HASH}" }},
                "resources": [
                    {{ "name": "libx", "version": "1.2", "url": "https://example.com/libx.tar.gz", "sha256": "ABCDEF" }}
                ],
                "build_backend": "sh",
                "entry_points": ["tool"]
            }}"#
        );

        let m = Manifest::from_json(&json).unwrap();
        assert_eq!(m.resources[0].label(), "libx 1.2");
        assert_eq!(m.resources[0].cache_key(), "abcdef");
        assert_eq!(m.primary_descriptor().unwrap().name, "tool");
    }

    #[test]
    fn from_json_rejects_unknown_algorithm() {
        let json = r#"{
            "primary_package": { "url": "https://example.com/t.tar.gz", "sha256": "ab", "hash_algorithm": "md5" },
            "build_backend": "sh"
        }"#;

        let err = Manifest::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn hash_algorithm_parses_case_insensitively() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("sha1".parse::<HashAlgorithm>().is_err());
    }
}
