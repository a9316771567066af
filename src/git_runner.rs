use std::{collections::HashMap, path::Path, process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Grace period between SIGTERM and SIGKILL when a child must be killed,
/// either on timeout or on abort.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Spawns and supervises the external `git` binary. No shell is involved —
/// the argument vector is passed straight to `exec`.
#[derive(Clone, Debug)]
pub struct GitRunner {
    timeout: Duration,
}

impl GitRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `git <args>` in `cwd` with exactly `env` as the child's
    /// environment (the caller's own environment is not inherited, so that
    /// `GIT_SSH_COMMAND` injection is the only source of truth). Returns
    /// stdout on a zero exit. Cancellable: if `abort_signal` fires, the
    /// child's whole process group is terminated and the call fails with
    /// `EngineError::Aborted`.
    pub async fn run(
        &self,
        args: &[&str],
        cwd: &Path,
        env: &HashMap<String, String>,
        abort_signal: &CancellationToken,
    ) -> Result<String, EngineError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so abort/timeout can terminate the whole
        // subtree (e.g. a credential helper `git push` spawns), not just
        // the immediate `git` process.
        #[cfg(unix)]
        command.process_group(0);

        debug!(?args, cwd = %cwd.display(), "spawning git");
        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Git {
                stderr: format!("failed to spawn git: {e}"),
                exit_code: -1,
            })?;

        let pid = child.id();

        let outcome = tokio::select! {
            biased;
            _ = abort_signal.cancelled() => Outcome::Aborted,
            result = timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => Outcome::Exited(output),
                Ok(Err(e)) => Outcome::SpawnError(e.to_string()),
                Err(_) => Outcome::TimedOut,
            },
        };

        match outcome {
            Outcome::Exited(output) => {
                if output.status.success() {
                    String::from_utf8(output.stdout).map_err(|e| EngineError::Git {
                        stderr: format!("git produced non-utf8 stdout: {e}"),
                        exit_code: 0,
                    })
                } else {
                    Err(EngineError::Git {
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                        exit_code: output.status.code().unwrap_or(-1),
                    })
                }
            }
            Outcome::SpawnError(message) => Err(EngineError::Git {
                stderr: message,
                exit_code: -1,
            }),
            Outcome::TimedOut => {
                if let Some(pid) = pid {
                    terminate_process_group(pid).await;
                }
                Err(EngineError::Timeout(self.timeout))
            }
            Outcome::Aborted => {
                if let Some(pid) = pid {
                    terminate_process_group(pid).await;
                }
                Err(EngineError::Aborted)
            }
        }
    }
}

enum Outcome {
    Exited(std::process::Output),
    SpawnError(String),
    TimedOut,
    Aborted,
}

/// SIGTERM the process group, wait a grace period, then SIGKILL if it is
/// still around. Not polled mid-syscall — this is the only cancellation
/// mechanism.
#[cfg(unix)]
async fn terminate_process_group(pid: u32) {
    let pgid = -(pid as i32);
    // SAFETY: kill(2) with a negated pid targets the process group; pid
    // came from a child we just spawned with its own process group (0),
    // so the group id equals the child's pid.
    unsafe {
        libc::kill(pgid, libc::SIGTERM);
    }
    tokio::time::sleep(KILL_GRACE_PERIOD).await;
    unsafe {
        if libc::kill(pgid, 0) == 0 {
            warn!(pid, "git process group still alive after SIGTERM, sending SIGKILL");
            libc::kill(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        env
    }

    #[tokio::test]
    async fn run_returns_stdout_on_success() {
        let runner = GitRunner::new(Duration::from_secs(5));
        let cwd = std::env::temp_dir();
        let output = runner
            .run(&["--version"], &cwd, &env(), &CancellationToken::new())
            .await
            .expect("git --version should succeed");
        assert!(output.contains("git version"));
    }

    #[tokio::test]
    async fn run_fails_with_git_error_on_nonzero_exit() {
        let runner = GitRunner::new(Duration::from_secs(5));
        let cwd = std::env::temp_dir();
        let err = runner
            .run(&["this-is-not-a-git-command"], &cwd, &env(), &CancellationToken::new())
            .await
            .expect_err("unknown git subcommand should fail");
        assert!(matches!(err, EngineError::Git { .. }));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn run_is_aborted_when_signal_fires_immediately() {
        let runner = GitRunner::new(Duration::from_secs(30));
        let cwd = std::env::temp_dir();
        let signal = CancellationToken::new();
        signal.cancel();
        let err = runner
            .run(&["--version"], &cwd, &env(), &signal)
            .await
            .expect_err("pre-cancelled signal should abort");
        assert!(matches!(err, EngineError::Aborted));
    }
}
