//! Build stage.
//!
//! The primary package's source tree is turned into a single installable
//! artifact by an external build backend. Backends are plain commands run
//! inside the source tree; each one writes its artifact into an output
//! directory (`dist/` unless configured otherwise).
//!
//! Built-in backends:
//! - `poetry` - `poetry build --format wheel --no-interaction`
//! - `python-build` - `python3 -m build --wheel`
//! - `make` - `make dist`
//! - `sh` - `sh build.sh`
//!
//! Further backends (or replacements for the built-in ones) come from
//! `InstallerConfig::backends`. Wheels from the Python backends are given
//! their console-script launchers in [`crate::wheel`] before installing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use hm_core::{BackendCommand, Error, InstallerConfig};

use crate::extract::{detect_archive, extract_archive, single_top_level_dir};
use crate::process::run_with_timeout;
use crate::traits::BuildBackend;

/// Build backend that runs a configured command per backend id.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    commands: BTreeMap<String, BackendCommand>,
    timeout: Duration,
}

fn builtin_backends() -> BTreeMap<String, BackendCommand> {
    BTreeMap::from([
        (
            "poetry".to_string(),
            BackendCommand::new("poetry", &["build", "--format", "wheel", "--no-interaction"]),
        ),
        (
            "python-build".to_string(),
            BackendCommand::new("python3", &["-m", "build", "--wheel"]),
        ),
        ("make".to_string(), BackendCommand::new("make", &["dist"])),
        ("sh".to_string(), BackendCommand::new("sh", &["build.sh"])),
    ])
}

impl CommandBackend {
    /// Built-in backends overlaid with the ones from `config`.
    pub fn from_config(config: &InstallerConfig) -> Self {
        let mut commands = builtin_backends();
        commands.extend(config.backends.clone());
        Self {
            commands,
            timeout: config.build_timeout(),
        }
    }

    fn command(&self, backend_id: &str) -> Result<&BackendCommand, Error> {
        self.commands
            .get(backend_id)
            .ok_or_else(|| Error::validation(format!("unknown build backend '{backend_id}'")))
    }
}

impl Default for CommandBackend {
    fn default() -> Self {
        Self::from_config(&InstallerConfig::default())
    }
}

#[async_trait]
impl BuildBackend for CommandBackend {
    fn supports(&self, backend_id: &str) -> bool {
        self.commands.contains_key(backend_id)
    }

    async fn build(&self, source_dir: &Path, backend_id: &str) -> Result<PathBuf, Error> {
        let backend = self.command(backend_id)?;
        let output_dir = source_dir.join(&backend.output_dir);

        // A stale artifact from the source archive would be indistinguishable
        // from the one we are about to build
        if output_dir.exists() {
            fs::remove_dir_all(&output_dir).map_err(|e| Error::BuildFailed {
                reason: format!("failed to clear {}: {e}", output_dir.display()),
                backend_output: String::new(),
            })?;
        }

        let mut command = Command::new(&backend.program);
        command.args(&backend.args).current_dir(source_dir);

        info!(backend = backend_id, source = %source_dir.display(), "building");

        let output = match run_with_timeout(command, self.timeout, &format!("build ({backend_id})")).await {
            Ok(output) => output,
            Err(Error::Timeout { seconds, .. }) => {
                return Err(Error::BuildFailed {
                    reason: format!("backend '{backend_id}' timed out after {seconds}s"),
                    backend_output: String::new(),
                });
            }
            Err(e) => {
                return Err(Error::BuildFailed {
                    reason: format!("failed to run backend '{backend_id}': {e}"),
                    backend_output: String::new(),
                });
            }
        };

        if !output.success() {
            let status = output
                .code
                .map(|c| format!("exit code {c}"))
                .unwrap_or_else(|| "a signal".to_string());
            return Err(Error::BuildFailed {
                reason: format!("backend '{backend_id}' failed with {status}"),
                backend_output: output.output,
            });
        }

        let artifact = single_artifact(&output_dir).map_err(|reason| Error::BuildFailed {
            reason,
            backend_output: output.output.clone(),
        })?;

        debug!(artifact = %artifact.display(), "build produced artifact");
        Ok(artifact)
    }
}

fn single_artifact(output_dir: &Path) -> Result<PathBuf, String> {
    let entries = fs::read_dir(output_dir)
        .map_err(|_| format!("no artifact: {} was not created", output_dir.display()))?;

    let mut artifacts: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    artifacts.sort();

    match artifacts.len() {
        1 => Ok(artifacts.remove(0)),
        0 => Err(format!("no artifact found in {}", output_dir.display())),
        n => Err(format!(
            "expected exactly one artifact in {}, found {n}",
            output_dir.display()
        )),
    }
}

/// Prepare the primary package's source tree under `dest` and return the
/// directory to build in.
///
/// Archives are unpacked and, when they wrap everything in one top-level
/// directory, that directory is returned. Anything else is copied in as-is.
pub fn stage_source(archive: &Path, dest: &Path, file_name: &str) -> Result<PathBuf, Error> {
    let stage_error = |message: String| Error::InstallIo {
        resource: archive.display().to_string(),
        message,
    };

    let kind = detect_archive(archive).map_err(|e| stage_error(format!("failed to read source: {e}")))?;
    if !kind.is_tar() {
        fs::create_dir_all(dest).map_err(|e| stage_error(format!("failed to create {}: {e}", dest.display())))?;
        fs::copy(archive, dest.join(file_name))
            .map_err(|e| stage_error(format!("failed to copy source: {e}")))?;
        return Ok(dest.to_path_buf());
    }

    extract_archive(archive, dest)?;
    single_top_level_dir(dest)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::tarball;
    use tempfile::TempDir;

    fn source_tree(script: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("build.sh"), script).unwrap();
        tmp
    }

    fn fast_backend() -> CommandBackend {
        let config = InstallerConfig {
            build_timeout_secs: 5,
            ..Default::default()
        };
        CommandBackend::from_config(&config)
    }

    #[test]
    fn builtin_backends_are_supported() {
        let backend = CommandBackend::default();
        for id in ["poetry", "python-build", "make", "sh"] {
            assert!(backend.supports(id), "{id}");
        }
        assert!(!backend.supports("cargo"));
    }

    #[test]
    fn config_adds_and_overrides_backends() {
        let mut config = InstallerConfig::default();
        config
            .backends
            .insert("cargo".to_string(), BackendCommand::new("cargo", &["package"]));
        config
            .backends
            .insert("make".to_string(), BackendCommand::new("gmake", &["dist"]));

        let backend = CommandBackend::from_config(&config);
        assert!(backend.supports("cargo"));
        assert_eq!(backend.command("make").unwrap().program, "gmake");
    }

    #[tokio::test]
    async fn sh_backend_returns_single_artifact() {
        let src = source_tree("mkdir -p dist && echo wheel > dist/pkg-1.0-py3-none-any.whl\n");

        let artifact = fast_backend().build(src.path(), "sh").await.unwrap();

        assert_eq!(artifact, src.path().join("dist/pkg-1.0-py3-none-any.whl"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_build_failed_with_output() {
        let src = source_tree("echo 'compiler exploded' >&2\nexit 1\n");

        let err = fast_backend().build(src.path(), "sh").await.unwrap_err();

        match err {
            Error::BuildFailed { reason, backend_output } => {
                assert!(reason.contains("exit code 1"));
                assert!(backend_output.contains("compiler exploded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_artifact_is_build_failed() {
        let src = source_tree("echo built nothing\n");

        let err = fast_backend().build(src.path(), "sh").await.unwrap_err();
        assert!(matches!(err, Error::BuildFailed { ref reason, .. } if reason.contains("no artifact")));
    }

    #[tokio::test]
    async fn multiple_artifacts_is_build_failed() {
        let src = source_tree("mkdir -p dist && touch dist/a.whl dist/b.whl\n");

        let err = fast_backend().build(src.path(), "sh").await.unwrap_err();
        assert!(matches!(err, Error::BuildFailed { ref reason, .. } if reason.contains("found 2")));
    }

    #[tokio::test]
    async fn stale_dist_is_cleared_before_building() {
        let src = source_tree("mkdir -p dist && touch dist/new.whl\n");
        fs::create_dir_all(src.path().join("dist")).unwrap();
        fs::write(src.path().join("dist/old.whl"), b"stale").unwrap();

        let artifact = fast_backend().build(src.path(), "sh").await.unwrap();
        assert_eq!(artifact.file_name().unwrap(), "new.whl");
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_build_failed() {
        let src = source_tree("sleep 30\n");
        let config = InstallerConfig {
            build_timeout_secs: 1,
            ..Default::default()
        };

        let err = CommandBackend::from_config(&config)
            .build(src.path(), "sh")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { ref reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn unknown_backend_is_validation_error() {
        let src = source_tree("");
        let err = fast_backend().build(src.path(), "scons").await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn stage_source_descends_into_wrapping_dir() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("src.blob");
        fs::write(&archive, tarball(&[("pkg-1.0/build.sh", b"true", 0o644)])).unwrap();

        let dir = stage_source(&archive, &tmp.path().join("build"), "pkg-1.0.tar.gz").unwrap();
        assert_eq!(dir, tmp.path().join("build/pkg-1.0"));
        assert!(dir.join("build.sh").exists());
    }

    #[test]
    fn stage_source_copies_plain_files() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("src.blob");
        fs::write(&script, b"#!/bin/sh\n").unwrap();

        let dir = stage_source(&script, &tmp.path().join("build"), "install.sh").unwrap();
        assert!(dir.join("install.sh").exists());
    }
}
