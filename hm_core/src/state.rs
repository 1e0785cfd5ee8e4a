//! Install run lifecycle.
//!
//! A run moves forward through a fixed sequence of states and ends in either
//! `Linked` (success) or `RolledBack` (any failure or cancellation). Skipping
//! a state or moving backwards is a programming error and is rejected.

use std::fmt;

/// State of a single install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Uninitialized,
    Validated,
    EnvironmentCreated,
    ResourcesInstalled,
    Built,
    ArtifactInstalled,
    Linked,
    RolledBack,
}

impl InstallState {
    /// The state that follows `self` on success, if any.
    pub fn next(self) -> Option<InstallState> {
        use InstallState::*;
        match self {
            Uninitialized => Some(Validated),
            Validated => Some(EnvironmentCreated),
            EnvironmentCreated => Some(ResourcesInstalled),
            ResourcesInstalled => Some(Built),
            Built => Some(ArtifactInstalled),
            ArtifactInstalled => Some(Linked),
            Linked | RolledBack => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstallState::Linked | InstallState::RolledBack)
    }

    /// Move to `to`. Only the single forward edge, or rollback from a
    /// non-terminal state, is allowed.
    pub fn transition(self, to: InstallState) -> Result<InstallState, IllegalTransition> {
        let allowed = match to {
            InstallState::RolledBack => !self.is_terminal(),
            _ => self.next() == Some(to),
        };

        if allowed {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallState::Uninitialized => "uninitialized",
            InstallState::Validated => "validated",
            InstallState::EnvironmentCreated => "environment created",
            InstallState::ResourcesInstalled => "resources installed",
            InstallState::Built => "built",
            InstallState::ArtifactInstalled => "artifact installed",
            InstallState::Linked => "linked",
            InstallState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: InstallState,
    pub to: InstallState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal install state transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The step of an install run an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Validate,
    CreateEnvironment,
    FetchResources,
    InstallResources,
    FetchPrimary,
    Build,
    InstallArtifact,
    Link,
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstallStep::Validate => "validating manifest",
            InstallStep::CreateEnvironment => "creating environment",
            InstallStep::FetchResources => "fetching resources",
            InstallStep::InstallResources => "installing resources",
            InstallStep::FetchPrimary => "fetching primary package",
            InstallStep::Build => "building primary package",
            InstallStep::InstallArtifact => "installing built artifact",
            InstallStep::Link => "linking entry points",
        };
        f.write_str(s)
    }
}
