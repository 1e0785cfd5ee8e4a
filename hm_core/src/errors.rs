use std::fmt;
use std::path::PathBuf;

use crate::state::InstallStep;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Validation {
        message: String,
    },
    EnvironmentExists {
        path: PathBuf,
    },
    NetworkFailure {
        url: String,
        message: String,
    },
    IntegrityFailure {
        resource: String,
        expected: String,
        actual: String,
    },
    BuildFailed {
        reason: String,
        backend_output: String,
    },
    Conflict {
        name: String,
        installed_hash: String,
        requested_hash: String,
    },
    InstallIo {
        resource: String,
        message: String,
    },
    LinkFailed {
        name: String,
        message: String,
    },
    SmokeTestFailed {
        entry_point: String,
        reason: String,
        output: String,
    },
    Timeout {
        operation: String,
        seconds: u64,
    },
    Cancelled,
    /// A failure inside an install run, tagged with the step and resource
    /// that was being processed when it happened.
    InstallFailed {
        step: InstallStep,
        resource: Option<String>,
        source: Box<Error>,
    },
}

impl Error {
    /// Unwrap any `InstallFailed` tagging down to the originating error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::InstallFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Integrity failures are never retryable: the pinned hash will not
    /// change and refetching untrusted content does not make it trusted.
    pub fn is_retryable(&self) -> bool {
        match self.root_cause() {
            Error::NetworkFailure { .. } => true,
            Error::Timeout { operation, .. } => operation.starts_with("fetch"),
            _ => false,
        }
    }

    /// Process exit code for the `hm` CLI.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            Error::Validation { .. } => 2,
            Error::NetworkFailure { .. } => 3,
            Error::IntegrityFailure { .. } => 4,
            Error::BuildFailed { .. } => 5,
            Error::EnvironmentExists { .. }
            | Error::Conflict { .. }
            | Error::InstallIo { .. }
            | Error::LinkFailed { .. } => 6,
            Error::SmokeTestFailed { .. } => 7,
            Error::Timeout { .. } => 8,
            Error::Cancelled => 130,
            Error::InstallFailed { .. } => 1,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation { message } => {
                write!(
                    f,
                    "invalid manifest: {}\n  hint: fix the manifest; validation errors are never retried",
                    message
                )
            }
            Error::EnvironmentExists { path } => {
                write!(
                    f,
                    "environment root '{}' already exists and is not empty\n  hint: choose a new --env directory or remove the old one",
                    path.display()
                )
            }
            Error::NetworkFailure { url, message } => {
                write!(
                    f,
                    "network error fetching '{}': {}\n  hint: check your internet connection and try again",
                    url, message
                )
            }
            Error::IntegrityFailure {
                resource,
                expected,
                actual,
            } => {
                write!(f, "checksum verification failed for '{}'", resource)?;
                write!(f, "\n  expected: {}\n  got:      {}", expected, actual)?;
                write!(
                    f,
                    "\n  hint: the source does not match its pinned hash; retrying will not help"
                )
            }
            Error::BuildFailed {
                reason,
                backend_output,
            } => {
                write!(f, "build failed: {}", reason)?;
                let tail = output_tail(backend_output, 20);
                if !tail.is_empty() {
                    write!(f, "\n  backend output:\n{}", tail)?;
                }
                Ok(())
            }
            Error::Conflict {
                name,
                installed_hash,
                requested_hash,
            } => {
                write!(
                    f,
                    "resource '{}' is already installed with different content\n  installed: {}\n  requested: {}\n  hint: install into a fresh environment to change pinned versions",
                    name, installed_hash, requested_hash
                )
            }
            Error::InstallIo { resource, message } => {
                write!(f, "failed to install '{}': {}", resource, message)
            }
            Error::LinkFailed { name, message } => {
                write!(f, "cannot link entry point '{}': {}", name, message)
            }
            Error::SmokeTestFailed {
                entry_point,
                reason,
                output,
            } => {
                write!(f, "smoke test for '{}' failed: {}", entry_point, reason)?;
                let tail = output_tail(output, 10);
                if !tail.is_empty() {
                    write!(f, "\n  output:\n{}", tail)?;
                }
                Ok(())
            }
            Error::Timeout { operation, seconds } => {
                write!(f, "{} timed out after {}s", operation, seconds)
            }
            Error::Cancelled => write!(f, "install cancelled"),
            Error::InstallFailed {
                step,
                resource,
                source,
            } => {
                match resource {
                    Some(name) => write!(f, "{} failed for '{}': ", step, name)?,
                    None => write!(f, "{} failed: ", step)?,
                }
                write!(f, "{}", source)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InstallFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Last `lines` lines of captured process output, indented for display.
fn output_tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..]
        .iter()
        .map(|l| format!("    {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}
