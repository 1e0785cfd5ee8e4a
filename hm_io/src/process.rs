//! Subprocess execution with a hard deadline.
//!
//! Every external program the installer runs (build backends, post-install
//! hooks, smoke tests) goes through `run_with_timeout`, so none of them can
//! block an install indefinitely.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use hm_core::Error;

/// Outcome of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `command` to completion, killing it if it outlives `timeout`.
///
/// Spawn failures map to `InstallIo`; a timeout maps to `Timeout` with
/// `operation` as the label. Callers decide what a non-zero exit means.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    operation: &str,
) -> Result<ProcessOutput, Error> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(operation, "spawning {:?}", command.as_std());

    let child = command.spawn().map_err(|e| Error::InstallIo {
        resource: operation.to_string(),
        message: format!("failed to spawn: {e}"),
    })?;

    // Dropping the wait future on timeout drops the child, which kills it
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(ProcessOutput {
                code: output.status.code(),
                output: combined,
            })
        }
        Ok(Err(e)) => Err(Error::InstallIo {
            resource: operation.to_string(),
            message: format!("failed to wait for process: {e}"),
        }),
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let out = run_with_timeout(sh("echo out; echo err >&2"), Duration::from_secs(10), "echo")
            .await
            .unwrap();

        assert!(out.success());
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let out = run_with_timeout(sh("exit 3"), Duration::from_secs(10), "exit")
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn kills_process_after_timeout() {
        let err = run_with_timeout(sh("sleep 30"), Duration::from_millis(100), "sleeper")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Timeout {
                operation: "sleeper".to_string(),
                seconds: 0,
            }
        );
    }

    #[tokio::test]
    async fn missing_program_is_install_io_error() {
        let cmd = Command::new("/nonexistent/hermit-no-such-binary");
        let err = run_with_timeout(cmd, Duration::from_secs(1), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InstallIo { .. }));
    }
}
