//! Isolated install environments.
//!
//! Layout under the environment root:
//!
//! ```text
//! bin/            entry point links (the only user-facing directory)
//! lib/<name>/     one private directory per installed resource
//! .hermit/        receipt database and writer lock
//! ```
//!
//! Resource names are single, non-hidden path components, so nothing in
//! `lib/` can collide with the staging directories (which start with `.`)
//! and `bin/` is never written by resource installs.
//!
//! An `Environment` holds an exclusive lock on `.hermit/lock` for its whole
//! lifetime, so only one writer may mutate an environment at a time. The
//! lock is never waited on; a second writer fails straight away.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, info};
use walkdir::WalkDir;

use hm_core::{Error, ResourceDescriptor};

use crate::extract::{detect_archive, extract_archive};
use crate::receipt::{InstalledResource, Receipt};

const BIN_DIR: &str = "bin";
const LIB_DIR: &str = "lib";
const META_DIR: &str = ".hermit";
const LOCK_FILE: &str = "lock";
const RECEIPT_FILE: &str = "receipt.db";

/// Executable a resource may ship to run once it is in place.
pub const POSTINSTALL_HOOK: &str = "hermit-postinstall";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceInstall {
    Installed,
    /// Same name and hash were already present; nothing changed.
    Unchanged,
}

pub struct Environment {
    root: PathBuf,
    bin_dir: PathBuf,
    lib_dir: PathBuf,
    receipt: Receipt,
    /// Whether `create` made the root directory itself.
    owns_root: bool,
    _lock: File,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").field("root", &self.root).finish()
    }
}

impl Environment {
    /// Create a fresh environment at `root`.
    ///
    /// Fails with `EnvironmentExists` if `root` already holds anything other
    /// than an unclaimed `.hermit/`, or if another writer claimed it first;
    /// an unknown prior install is never built upon. On failure only the
    /// directories this call made are removed.
    pub fn create(root: &Path) -> Result<Self, Error> {
        let mut made = Vec::new();
        match Self::claim(root, &mut made) {
            Ok(env) => {
                info!(root = %root.display(), "created environment");
                Ok(env)
            }
            Err(e) => {
                for dir in made.iter().rev() {
                    let _ = fs::remove_dir_all(dir);
                }
                Err(e)
            }
        }
    }

    fn claim(root: &Path, made: &mut Vec<PathBuf>) -> Result<Self, Error> {
        let exists = || Error::EnvironmentExists {
            path: root.to_path_buf(),
        };

        if let Some(parent) = root.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| env_io(root, "create parent directory", e))?;
        }
        if !make_dir(root, made).map_err(|e| env_io(root, "create directory", e))?
            && !holds_only_meta(root)
        {
            return Err(exists());
        }

        let meta = root.join(META_DIR);
        make_dir(&meta, made).map_err(|e| env_io(root, "create directory", e))?;
        let Some(lock) = try_lock(&meta)? else {
            // The lock holder now shares whatever this call made
            made.clear();
            return Err(exists());
        };

        // The lock holder lays out bin/ and lib/; finding either already
        // there means an earlier writer got this far.
        for dir in [BIN_DIR, LIB_DIR] {
            if !make_dir(&root.join(dir), made).map_err(|e| env_io(root, "create directory", e))? {
                return Err(exists());
            }
        }

        let receipt = Receipt::open(&meta.join(RECEIPT_FILE))?;
        Ok(Self::assemble(root, receipt, lock, made.first().map(PathBuf::as_path) == Some(root)))
    }

    /// Reopen an environment created earlier, taking the writer lock.
    ///
    /// Fails immediately with `InstallIo` if another writer holds it.
    pub fn open(root: &Path) -> Result<Self, Error> {
        let meta = root.join(META_DIR);
        if !meta.is_dir() {
            return Err(Error::InstallIo {
                resource: root.display().to_string(),
                message: "not a hermit environment".to_string(),
            });
        }

        let lock = try_lock(&meta)?.ok_or_else(|| Error::InstallIo {
            resource: root.display().to_string(),
            message: "environment is locked by another writer".to_string(),
        })?;
        let receipt = Receipt::open(&meta.join(RECEIPT_FILE))?;
        Ok(Self::assemble(root, receipt, lock, false))
    }

    fn assemble(root: &Path, receipt: Receipt, lock: File, owns_root: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            bin_dir: root.join(BIN_DIR),
            lib_dir: root.join(LIB_DIR),
            receipt,
            owns_root,
            _lock: lock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Private directory of an installed resource.
    pub fn resource_dir(&self, name: &str) -> PathBuf {
        self.lib_dir.join(name)
    }

    pub fn installed_resources(&self) -> Result<Vec<InstalledResource>, Error> {
        self.receipt.list_resources()
    }

    pub fn is_installed(&self, name: &str) -> Result<bool, Error> {
        Ok(self.receipt.get_resource(name)?.is_some())
    }

    /// Entry point name to link target.
    pub fn linked_entry_points(&self) -> Result<BTreeMap<String, PathBuf>, Error> {
        Ok(self
            .receipt
            .list_entry_points()?
            .into_iter()
            .map(|l| (l.name, PathBuf::from(l.target_path)))
            .collect())
    }

    /// Unpack or copy a verified payload into `lib/<name>/` and record it.
    ///
    /// Re-installing a name with the same content hash is a no-op; with a
    /// different hash it is a `Conflict`.
    pub fn install_resource(
        &mut self,
        local_path: &Path,
        descriptor: &ResourceDescriptor,
    ) -> Result<ResourceInstall, Error> {
        let name = descriptor.name.as_str();

        if let Some(existing) = self.receipt.get_resource(name)? {
            if existing
                .content_hash
                .eq_ignore_ascii_case(&descriptor.content_hash)
            {
                debug!(resource = name, "already installed with identical content");
                return Ok(ResourceInstall::Unchanged);
            }
            return Err(Error::Conflict {
                name: name.to_string(),
                installed_hash: existing.content_hash,
                requested_hash: descriptor.content_hash.clone(),
            });
        }

        let dest = self.resource_dir(name);
        if dest.exists() {
            return Err(Error::InstallIo {
                resource: name.to_string(),
                message: format!("{} exists but is not recorded", dest.display()),
            });
        }

        let staging = self
            .lib_dir
            .join(format!(".{name}.tmp.{}", std::process::id()));
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }

        if let Err(e) = stage_payload(local_path, &staging, descriptor) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &dest) {
            let _ = fs::remove_dir_all(&staging);
            return Err(Error::InstallIo {
                resource: name.to_string(),
                message: format!("failed to move into place: {e}"),
            });
        }

        self.receipt.record_resource(
            name,
            descriptor.version.as_deref(),
            &descriptor.content_hash.to_ascii_lowercase(),
        )?;

        debug!(resource = name, dest = %dest.display(), "installed resource");
        Ok(ResourceInstall::Installed)
    }

    /// Post-install hook shipped by an installed resource, if any.
    ///
    /// Looked up at the resource root and inside a single wrapping
    /// directory, where source archives usually put their contents.
    pub fn postinstall_hook(&self, name: &str) -> Option<PathBuf> {
        let dir = self.resource_dir(name);
        let direct = dir.join(POSTINSTALL_HOOK);
        if direct.is_file() {
            return Some(direct);
        }

        let entries: Vec<PathBuf> = fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        match entries.as_slice() {
            [only] if only.is_dir() => {
                let nested = only.join(POSTINSTALL_HOOK);
                nested.is_file().then_some(nested)
            }
            _ => None,
        }
    }

    /// Locate the executable an entry point should link to.
    ///
    /// Searches the `prefer` resource first, then every other resource in
    /// install order; within a resource the shallowest match wins and
    /// `bin/` directories beat everything else at the same depth.
    pub fn find_executable(&self, name: &str, prefer: Option<&str>) -> Result<Option<PathBuf>, Error> {
        let mut order: Vec<String> = Vec::new();
        if let Some(p) = prefer {
            order.push(p.to_string());
        }
        for resource in self.receipt.list_resources()? {
            if Some(resource.name.as_str()) != prefer {
                order.push(resource.name);
            }
        }

        for resource in order {
            if let Some(found) = find_in(&self.resource_dir(&resource), name) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Point `bin/<name>` at `target`, replacing any previous link.
    pub fn link_entry_point(&mut self, name: &str, target: &Path) -> Result<PathBuf, Error> {
        let link_error = |message: String| Error::LinkFailed {
            name: name.to_string(),
            message,
        };

        if !target.is_file() {
            return Err(link_error(format!("target {} does not exist", target.display())));
        }

        let link_path = self.bin_dir.join(name);
        if fs::symlink_metadata(&link_path).is_ok() {
            fs::remove_file(&link_path)
                .map_err(|e| link_error(format!("failed to replace existing link: {e}")))?;
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &link_path)
            .map_err(|e| link_error(format!("failed to create symlink: {e}")))?;

        #[cfg(not(unix))]
        fs::copy(target, &link_path)
            .map(|_| ())
            .map_err(|e| link_error(format!("failed to copy executable: {e}")))?;

        self.receipt
            .record_entry_point(name, &target.to_string_lossy())?;

        debug!(entry_point = name, target = %target.display(), "linked entry point");
        Ok(link_path)
    }

    /// Delete the environment from disk. Used to roll back a failed install.
    ///
    /// A root that existed before `create` is kept; only the layout inside
    /// it is removed.
    pub fn destroy(self) -> Result<(), Error> {
        let root = self.root.clone();
        let owns_root = self.owns_root;
        // Release the lock and close the receipt before removing their files
        drop(self);

        if owns_root {
            fs::remove_dir_all(&root).map_err(|e| env_io(&root, "remove environment", e))?;
        } else {
            for dir in [BIN_DIR, LIB_DIR, META_DIR] {
                let path = root.join(dir);
                if path.exists() {
                    fs::remove_dir_all(&path).map_err(|e| env_io(&root, "remove environment", e))?;
                }
            }
        }
        info!(root = %root.display(), "removed environment");
        Ok(())
    }
}

fn stage_payload(local_path: &Path, staging: &Path, descriptor: &ResourceDescriptor) -> Result<(), Error> {
    let io_error = |message: String| Error::InstallIo {
        resource: descriptor.name.clone(),
        message,
    };

    let kind = detect_archive(local_path)
        .map_err(|e| io_error(format!("failed to read payload: {e}")))?;

    if kind.is_tar() {
        extract_archive(local_path, staging).map_err(|e| match e {
            Error::InstallIo { message, .. } => io_error(message),
            other => other,
        })?;
    } else {
        fs::create_dir_all(staging)
            .map_err(|e| io_error(format!("failed to create staging directory: {e}")))?;
        let file_name = payload_file_name(descriptor);
        fs::copy(local_path, staging.join(&file_name))
            .map_err(|e| io_error(format!("failed to copy payload: {e}")))?;
    }

    Ok(())
}

/// File name for a payload that is copied rather than unpacked: the last
/// URL path segment (e.g. `cli-0.1.0-py3-none-any.whl`), else the
/// resource name.
pub(crate) fn payload_file_name(descriptor: &ResourceDescriptor) -> String {
    let url = descriptor.source_url.as_str();
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| {
            !segment.is_empty() && *segment != "." && *segment != ".." && !segment.contains('\\')
        })
        .map(str::to_string)
        .unwrap_or_else(|| descriptor.name.clone())
}

fn find_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut best: Option<(usize, bool, PathBuf)> = None;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(4)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_name() != name || !entry.file_type().is_file() || !is_executable(entry.path()) {
            continue;
        }

        let in_bin = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == "bin");
        let candidate = (entry.depth(), !in_bin, entry.path().to_path_buf());

        if best.as_ref().is_none_or(|b| (candidate.0, candidate.1) < (b.0, b.1)) {
            best = Some(candidate);
        }
    }

    best.map(|(_, _, path)| path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Create a single directory, reporting whether this call made it.
fn make_dir(path: &Path, made: &mut Vec<PathBuf>) -> io::Result<bool> {
    match fs::create_dir(path) {
        Ok(()) => {
            made.push(path.to_path_buf());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(e) => Err(e),
    }
}

fn holds_only_meta(root: &Path) -> bool {
    fs::read_dir(root)
        .map(|entries| entries.filter_map(|e| e.ok()).all(|e| e.file_name() == META_DIR))
        .unwrap_or(false)
}

/// Take the writer lock without waiting. `None` means another writer has it.
fn try_lock(meta: &Path) -> Result<Option<File>, Error> {
    let lock_error = |e: io::Error| Error::InstallIo {
        resource: meta.display().to_string(),
        message: format!("failed to acquire environment lock: {e}"),
    };

    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(meta.join(LOCK_FILE))
        .map_err(lock_error)?;
    match file.try_lock_exclusive() {
        Ok(true) => Ok(Some(file)),
        Ok(false) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(lock_error(e)),
    }
}

fn env_io(root: &Path, action: &str, e: io::Error) -> Error {
    Error::InstallIo {
        resource: root.display().to_string(),
        message: format!("failed to {action}: {e}"),
    }
}
