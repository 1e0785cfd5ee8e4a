use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use hm_core::Error;

/// Run `bin/<entry_point>` from an installed environment and require a
/// clean exit within `timeout`.
///
/// Takes the environment's root rather than an `Environment` so that no
/// writer lock is needed to check an install.
pub async fn run_smoke_test(
    env_root: &Path,
    entry_point: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), Error> {
    let failed = |reason: String, output: String| Error::SmokeTestFailed {
        entry_point: entry_point.to_string(),
        reason,
        output,
    };

    let bin_dir = env_root.join("bin");
    let executable = bin_dir.join(entry_point);
    if !executable.exists() {
        return Err(failed(
            format!("{} is not linked", executable.display()),
            String::new(),
        ));
    }

    let mut command = Command::new(&executable);
    command.args(args).current_dir(env_root);
    if let Some(path) = std::env::var_os("PATH") {
        let mut paths = vec![bin_dir.clone()];
        paths.extend(std::env::split_paths(&path));
        if let Ok(joined) = std::env::join_paths(paths) {
            command.env("PATH", joined);
        }
    }

    let output = match crate::process::run_with_timeout(command, timeout, entry_point).await {
        Ok(output) => output,
        Err(Error::Timeout { seconds, .. }) => {
            return Err(failed(format!("timed out after {seconds}s"), String::new()));
        }
        Err(e) => return Err(failed(e.to_string(), String::new())),
    };

    if output.success() {
        debug!(entry_point, "smoke test passed");
        Ok(())
    } else {
        let reason = match output.code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by a signal".to_string(),
        };
        warn!(entry_point, %reason, "smoke test failed");
        Err(failed(reason, output.output))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn env_with_tool(script: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        let tool = tmp.path().join("bin/tool");
        fs::write(&tool, script).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        tmp
    }

    fn help() -> Vec<String> {
        vec!["--help".to_string()]
    }

    #[tokio::test]
    async fn passes_on_zero_exit() {
        let env = env_with_tool("#!/bin/sh\n[ \"$1\" = --help ] && echo usage\n");
        run_smoke_test(env.path(), "tool", &help(), Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let env = env_with_tool("#!/bin/sh\necho 'ImportError: no module' >&2\nexit 1\n");

        let err = run_smoke_test(env.path(), "tool", &help(), Duration::from_secs(10))
            .await
            .unwrap_err();

        match err {
            Error::SmokeTestFailed { entry_point, reason, output } => {
                assert_eq!(entry_point, "tool");
                assert_eq!(reason, "exited with code 1");
                assert!(output.contains("ImportError"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hanging_entry_point_fails() {
        let env = env_with_tool("#!/bin/sh\nsleep 30\n");

        let err = run_smoke_test(env.path(), "tool", &help(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SmokeTestFailed { ref reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn missing_entry_point_fails() {
        let env = TempDir::new().unwrap();
        let err = run_smoke_test(env.path(), "tool", &help(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SmokeTestFailed { .. }));
        assert_eq!(err.exit_code(), 7);
    }
}
