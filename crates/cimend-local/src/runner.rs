//! Shell command execution inside a workspace directory.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use cimend_core::sandbox::{CommandOutput, CommandSpec, SandboxError, SandboxResult};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs one [`CommandSpec`] through `sh -c` with its working directory set
/// to the workspace root.
pub struct CommandRunner;

impl CommandRunner {
    /// Execute `spec` in `cwd`, returning combined stdout and stderr.
    ///
    /// The command runs in its own process group. On timeout the whole group
    /// is killed, so background jobs it started do not outlive it. Dropping
    /// the future kills only the shell.
    pub async fn execute(
        spec: &CommandSpec,
        cwd: &Path,
        max_output_bytes: usize,
    ) -> SandboxResult<CommandOutput> {
        let start = Instant::now();

        if spec.command.trim().is_empty() {
            return Err(SandboxError::Exec {
                command: spec.command.clone(),
                reason: "empty command".to_string(),
            });
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn().map_err(|e| SandboxError::Exec {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let waited = if spec.timeout_secs > 0 {
            match tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            {
                Ok(waited) => waited,
                Err(_) => {
                    if let Some(pid) = pid {
                        kill_group(pid).await;
                    }
                    return Err(SandboxError::Timeout {
                        command: spec.command.clone(),
                        limit_secs: spec.timeout_secs,
                    });
                }
            }
        } else {
            child.wait_with_output().await
        };
        let output = waited.map_err(|e| SandboxError::Exec {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        debug!(
            command = %spec.command,
            exit_code = ?output.status.code(),
            duration_ms,
            "command finished"
        );

        Ok(CommandOutput {
            exit_code: output.status.code(),
            output: keep_tail(combined, max_output_bytes),
            duration_ms,
        })
    }
}

/// SIGKILL every process in group `pgid`. The group leader is the shell,
/// whose pid doubles as the group id.
#[cfg(unix)]
async fn kill_group(pgid: u32) {
    let status = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => debug!(pgid, "killed timed-out process group"),
        Ok(s) => warn!(pgid, exit_code = ?s.code(), "kill of process group failed"),
        Err(e) => warn!(pgid, error = %e, "could not run kill for process group"),
    }
}

#[cfg(not(unix))]
async fn kill_group(_pgid: u32) {}

/// Keep at most `max` trailing bytes, cut on a char boundary.
fn keep_tail(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, timeout_secs: u64) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            timeout_secs,
        }
    }

    #[test]
    fn test_keep_tail_respects_char_boundaries() {
        assert_eq!(keep_tail("abcdef".into(), 3), "def");
        assert_eq!(keep_tail("short".into(), 64), "short");
        let cut = keep_tail("xé".repeat(4), 4);
        assert!(cut.len() <= 4);
        assert!(cut.ends_with('é'));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = CommandRunner::execute(&spec("echo hello", 60), dir.path(), 4096)
            .await
            .expect("execute failed");
        assert!(out.success());
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command_merges_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = CommandRunner::execute(&spec("echo oops >&2; exit 3", 60), dir.path(), 4096)
            .await
            .expect("execute failed");
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_runs_in_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let out = CommandRunner::execute(&spec("cat marker.txt", 60), dir.path(), 4096)
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "here");
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::execute(&spec("sleep 5", 1), dir.path(), 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { limit_secs: 1, .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::execute(
            &spec("sleep 30 & echo $! > child.pid; wait", 1),
            dir.path(),
            4096,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { .. }));

        let child = std::fs::read_to_string(dir.path().join("child.pid")).unwrap();
        let child = child.trim().to_string();
        let mut alive = true;
        for _ in 0..50 {
            // A reaped or zombie process counts as dead.
            let stat = std::fs::read_to_string(format!("/proc/{child}/stat")).unwrap_or_default();
            let state = stat.rsplit(')').next().and_then(|rest| rest.trim().chars().next());
            if matches!(state, None | Some('Z') | Some('X')) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {child} survived the timeout");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandRunner::execute(&spec("  ", 60), dir.path(), 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Exec { .. }));
    }
}
