//! Install orchestration.
//!
//! An install run validates the manifest, creates a fresh environment,
//! fetches every resource through the shared fetch cache, installs them one
//! at a time in manifest order, builds the primary package, installs the
//! built artifact (turning a wheel into an installable tree first) and
//! links the entry points. Any failure after the environment exists removes
//! it again; the caller either gets a complete environment or nothing this
//! run created on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hm_core::{
    Error, HashAlgorithm, InstallState, InstallStep, InstallerConfig, Manifest, ResourceDescriptor,
};

use crate::build::stage_source;
use crate::environment::{Environment, ResourceInstall, payload_file_name};
use crate::extract::{ArchiveKind, detect_archive};
use crate::fetch::FetchCache;
use crate::process::run_with_timeout;
use crate::progress::{InstallProgress, ProgressCallback};
use crate::traits::BuildBackend;
use crate::wheel::wheel_to_tarball;


/// Cooperative cancellation flag shared between an install run and whoever
/// may want to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct Installer {
    fetch_cache: Arc<FetchCache>,
    backend: Arc<dyn BuildBackend>,
    config: InstallerConfig,
}

impl Installer {
    pub fn new(
        fetch_cache: Arc<FetchCache>,
        backend: Arc<dyn BuildBackend>,
        config: InstallerConfig,
    ) -> Self {
        Self {
            fetch_cache,
            backend,
            config,
        }
    }

    pub fn fetch_cache(&self) -> &Arc<FetchCache> {
        &self.fetch_cache
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Install `manifest` into a new environment at `root`.
    pub async fn install(&self, manifest: &Manifest, root: &Path) -> Result<Environment, Error> {
        self.install_with(manifest, root, &CancelToken::new(), None)
            .await
    }

    /// Install with a cancellation token and optional progress reporting.
    ///
    /// Errors are returned as `Error::InstallFailed`, tagged with the step
    /// (and resource, where there is one) that failed.
    pub async fn install_with(
        &self,
        manifest: &Manifest,
        root: &Path,
        cancel: &CancelToken,
        progress: Option<Arc<ProgressCallback>>,
    ) -> Result<Environment, Error> {
        let mut run = Run::new(progress);

        self.validate(manifest)
            .map_err(|e| failed(InstallStep::Validate, None, e))?;
        run.advance(InstallState::Validated)?;

        cancel
            .check()
            .map_err(|e| failed(InstallStep::CreateEnvironment, None, e))?;

        let mut env = Environment::create(root)
            .map_err(|e| failed(InstallStep::CreateEnvironment, None, e))?;
        run.advance(InstallState::EnvironmentCreated)?;

        match self.populate(&mut env, manifest, cancel, &mut run).await {
            Ok(()) => {
                run.advance(InstallState::Linked)?;
                info!(root = %root.display(), "install complete");
                Ok(env)
            }
            Err(e) => {
                self.roll_back(env, &mut run, &e);
                Err(e)
            }
        }
    }

    fn validate(&self, manifest: &Manifest) -> Result<(), Error> {
        manifest.validate()?;
        if !self.backend.supports(&manifest.build_backend) {
            return Err(Error::validation(format!(
                "unknown build backend '{}'",
                manifest.build_backend
            )));
        }
        Ok(())
    }

    /// Everything between creating the environment and linking. Errors
    /// returned from here trigger rollback.
    async fn populate(
        &self,
        env: &mut Environment,
        manifest: &Manifest,
        cancel: &CancelToken,
        run: &mut Run,
    ) -> Result<(), Error> {
        let primary = manifest
            .primary_descriptor()
            .map_err(|e| failed(InstallStep::Validate, None, e))?;

        let primary_source = self
            .install_resources(env, &manifest.resources, &primary, cancel, run)
            .await?;
        run.advance(InstallState::ResourcesInstalled)?;

        let tag_build = |e| failed(InstallStep::Build, Some(primary.name.as_str()), e);
        cancel.check().map_err(tag_build)?;

        let build_dir = tempfile::Builder::new()
            .prefix("hermit-build-")
            .tempdir()
            .map_err(|e| {
                tag_build(Error::InstallIo {
                    resource: primary.name.clone(),
                    message: format!("failed to create build directory: {e}"),
                })
            })?;
        let source_dir = stage_source(&primary_source, build_dir.path(), &payload_file_name(&primary))
            .map_err(tag_build)?;

        run.report(InstallProgress::BuildStarted {
            backend: manifest.build_backend.clone(),
        });
        let artifact = self
            .backend
            .build(&source_dir, &manifest.build_backend)
            .await
            .map_err(tag_build)?;
        run.report(InstallProgress::BuildCompleted {
            artifact: artifact.clone(),
        });
        run.advance(InstallState::Built)?;

        let tag_artifact = |e| failed(InstallStep::InstallArtifact, Some(primary.name.as_str()), e);
        cancel.check().map_err(tag_artifact)?;
        let kind = detect_archive(&artifact).map_err(|e| {
            tag_artifact(Error::InstallIo {
                resource: primary.name.clone(),
                message: format!("failed to read artifact {}: {e}", artifact.display()),
            })
        })?;
        let artifact = if kind == ArchiveKind::Zip {
            wheel_to_tarball(
                &artifact,
                build_dir.path(),
                &env.resource_dir(&primary.name),
                self.config.build_timeout(),
            )
            .await
            .map_err(tag_artifact)?
        } else {
            artifact
        };
        let artifact_descriptor = artifact_descriptor(&primary, &artifact).map_err(tag_artifact)?;
        self.install_one(env, &artifact, &artifact_descriptor, run)
            .await
            .map_err(tag_artifact)?;
        drop(build_dir);
        run.advance(InstallState::ArtifactInstalled)?;

        for entry_point in &manifest.entry_points {
            let tag_link = |e| failed(InstallStep::Link, Some(entry_point.as_str()), e);
            cancel.check().map_err(tag_link)?;

            let target = env
                .find_executable(entry_point, Some(primary.name.as_str()))
                .map_err(tag_link)?
                .ok_or_else(|| {
                    tag_link(Error::LinkFailed {
                        name: entry_point.clone(),
                        message: "no executable with this name in the environment".to_string(),
                    })
                })?;
            env.link_entry_point(entry_point, &target).map_err(tag_link)?;
            run.report(InstallProgress::LinkCompleted {
                entry_point: entry_point.clone(),
            });
        }

        Ok(())
    }

    /// Fetch all resources plus the primary source, installing resources
    /// strictly in manifest order as their fetches complete. Returns the
    /// cached path of the primary source.
    async fn install_resources(
        &self,
        env: &mut Environment,
        resources: &[ResourceDescriptor],
        primary: &ResourceDescriptor,
        cancel: &CancelToken,
        run: &mut Run,
    ) -> Result<PathBuf, Error> {
        let mut descriptors = resources.to_vec();
        descriptors.push(primary.clone());

        // Fetches keep running in the background while earlier resources
        // are being unpacked
        let (tx, mut rx) = mpsc::channel(descriptors.len());
        let cache = Arc::clone(&self.fetch_cache);
        let owned = descriptors.clone();
        let _driver = AbortOnDrop(tokio::spawn(async move {
            let mut results = cache.fetch_ordered(&owned);
            while let Some(result) = results.next().await {
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        }));

        for (index, descriptor) in descriptors.iter().enumerate() {
            let is_primary = index == resources.len();
            let step = if is_primary {
                InstallStep::FetchPrimary
            } else {
                InstallStep::FetchResources
            };
            let tag_fetch = |e| failed(step, Some(descriptor.name.as_str()), e);

            let path = rx
                .recv()
                .await
                .ok_or_else(|| {
                    tag_fetch(Error::InstallIo {
                        resource: descriptor.name.clone(),
                        message: "fetch stopped before completing".to_string(),
                    })
                })?
                .map_err(tag_fetch)?;
            run.report(InstallProgress::FetchCompleted {
                name: descriptor.name.clone(),
            });

            if is_primary {
                return Ok(path);
            }

            let tag_install = |e| failed(InstallStep::InstallResources, Some(descriptor.name.as_str()), e);
            cancel.check().map_err(tag_install)?;
            self.install_one(env, &path, descriptor, run)
                .await
                .map_err(tag_install)?;
        }

        Err(failed(
            InstallStep::FetchPrimary,
            Some(primary.name.as_str()),
            Error::InstallIo {
                resource: primary.name.clone(),
                message: "primary package was not fetched".to_string(),
            },
        ))
    }

    async fn install_one(
        &self,
        env: &mut Environment,
        path: &Path,
        descriptor: &ResourceDescriptor,
        run: &mut Run,
    ) -> Result<(), Error> {
        run.report(InstallProgress::InstallStarted {
            name: descriptor.name.clone(),
        });

        let outcome = env.install_resource(path, descriptor)?;
        if outcome == ResourceInstall::Installed {
            let hook = env.postinstall_hook(&descriptor.name);
            if let Some(hook) = hook {
                run.report(InstallProgress::HookStarted {
                    name: descriptor.name.clone(),
                });
                let env_root = env.root().to_path_buf();
                let lib_dir = env.lib_dir().to_path_buf();
                self.run_hook(&hook, &env_root, &lib_dir, &descriptor.name)
                    .await?;
            }
        }

        run.report(InstallProgress::InstallCompleted {
            name: descriptor.name.clone(),
        });
        Ok(())
    }

    async fn run_hook(&self, hook: &Path, env_root: &Path, lib_dir: &Path, name: &str) -> Result<(), Error> {
        let mut command = Command::new(hook);
        command
            .current_dir(hook.parent().unwrap_or(env_root))
            .env("HERMIT_ENV_ROOT", env_root)
            .env("HERMIT_LIB_DIR", lib_dir)
            .env("HERMIT_RESOURCE", name);

        debug!(resource = name, hook = %hook.display(), "running post-install hook");
        let output = run_with_timeout(
            command,
            self.config.build_timeout(),
            &format!("post-install hook for {name}"),
        )
        .await?;

        if output.success() {
            return Ok(());
        }

        let status = output
            .code
            .map(|c| format!("exit code {c}"))
            .unwrap_or_else(|| "a signal".to_string());
        let last_line = output.output.lines().last().unwrap_or_default().to_string();
        Err(Error::InstallIo {
            resource: name.to_string(),
            message: format!("post-install hook failed with {status}: {last_line}"),
        })
    }

    fn roll_back(&self, env: Environment, run: &mut Run, error: &Error) {
        let step = match error {
            Error::InstallFailed { step, .. } => *step,
            _ => InstallStep::CreateEnvironment,
        };
        warn!(%step, "install failed, rolling back: {}", error.root_cause());

        if let Err(e) = run.advance(InstallState::RolledBack) {
            warn!("{e}");
        }

        let root = env.root().to_path_buf();
        if let Err(e) = env.destroy() {
            warn!(root = %root.display(), "failed to remove environment: {e}");
        }
        run.report(InstallProgress::RolledBack { step });
    }
}

/// Lifecycle bookkeeping for one run.
struct Run {
    state: InstallState,
    progress: Option<Arc<ProgressCallback>>,
}

impl Run {
    fn new(progress: Option<Arc<ProgressCallback>>) -> Self {
        Self {
            state: InstallState::Uninitialized,
            progress,
        }
    }

    fn advance(&mut self, to: InstallState) -> Result<(), Error> {
        self.state = self.state.transition(to).map_err(|e| Error::InstallIo {
            resource: "installer".to_string(),
            message: e.to_string(),
        })?;
        debug!(state = %self.state, "install state");
        self.report(InstallProgress::StateChanged { state: self.state });
        Ok(())
    }

    fn report(&self, event: InstallProgress) {
        if let Some(cb) = &self.progress {
            cb(event);
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn failed(step: InstallStep, resource: Option<&str>, source: Error) -> Error {
    if matches!(source, Error::InstallFailed { .. }) {
        return source;
    }
    Error::InstallFailed {
        step,
        resource: resource.map(str::to_string),
        source: Box::new(source),
    }
}

/// The built artifact, described as the resource that installs it under
/// the primary package's name.
fn artifact_descriptor(primary: &ResourceDescriptor, artifact: &Path) -> Result<ResourceDescriptor, Error> {
    let content_hash = hm_core::digest_file(artifact, HashAlgorithm::Sha256).map_err(|e| {
        Error::InstallIo {
            resource: primary.name.clone(),
            message: format!("failed to hash artifact {}: {e}", artifact.display()),
        }
    })?;

    Ok(ResourceDescriptor {
        name: primary.name.clone(),
        version: primary.version.clone(),
        source_url: artifact.to_string_lossy().into_owned(),
        content_hash,
        hash_algorithm: HashAlgorithm::Sha256,
    })
}
