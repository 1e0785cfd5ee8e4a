use std::path::PathBuf;

use hm_core::{InstallState, InstallStep};

/// Events reported while an install run progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallProgress {
    StateChanged {
        state: InstallState,
    },
    /// A payload is verified and available in the fetch cache.
    FetchCompleted {
        name: String,
    },
    InstallStarted {
        name: String,
    },
    InstallCompleted {
        name: String,
    },
    HookStarted {
        name: String,
    },
    BuildStarted {
        backend: String,
    },
    BuildCompleted {
        artifact: PathBuf,
    },
    LinkCompleted {
        entry_point: String,
    },
    RolledBack {
        step: InstallStep,
    },
}

pub type ProgressCallback = Box<dyn Fn(InstallProgress) + Send + Sync>;
