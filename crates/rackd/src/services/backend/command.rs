//! Bounded external command execution

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::BackendError;

/// Exit code and captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external programs for the process backends
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, BackendError>;
}

/// Runs commands with tokio, bounded by a timeout. Only timeouts are
/// retried; a command that ran and failed is reported as is.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
    retries: u32,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries: retries.max(1),
        }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(8), 3)
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, BackendError> {
        let command_line = format!("{} {}", program, args.join(" "));

        for attempt in 1..=self.retries {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .env("LANG", "C.UTF-8")
                .env("LC_ALL", "C.UTF-8")
                .kill_on_drop(true);

            match tokio::time::timeout(self.timeout, cmd.output()).await {
                Ok(Ok(output)) => {
                    let result = CommandOutput {
                        code: output.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    };
                    debug!(command = %command_line, code = result.code, "Command finished");
                    return Ok(result);
                }
                Ok(Err(source)) => {
                    return Err(BackendError::Spawn {
                        command: command_line,
                        source,
                    });
                }
                Err(_) => {
                    warn!(
                        command = %command_line,
                        "Timed out after {:?} (attempt {}/{})",
                        self.timeout,
                        attempt,
                        self.retries
                    );
                }
            }
        }

        Err(BackendError::Timeout {
            command: command_line,
            timeout_secs: self.timeout.as_secs(),
            retries: self.retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let runner = TokioCommandRunner::default();
        let output = runner
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_timeout_after_retries() {
        let runner = TokioCommandRunner::new(Duration::from_millis(50), 2);
        let err = runner.run("sleep", &["5".to_string()]).await.unwrap_err();
        match err {
            BackendError::Timeout { command, retries, .. } => {
                assert_eq!(command, "sleep 5");
                assert_eq!(retries, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = TokioCommandRunner::default();
        let err = runner.run("/nonexistent/rackd-test-binary", &[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }
}
