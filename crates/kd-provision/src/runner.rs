use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed run with the given exit code and `stderr`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last `max_chars` characters of stderr, trimmed, for error messages.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        let trimmed = self.stderr.trim();
        let count = trimmed.chars().count();
        if count <= max_chars {
            trimmed.to_string()
        } else {
            trimmed.chars().skip(count - max_chars).collect()
        }
    }

    /// One-line description of a failed run.
    pub fn describe_failure(&self, program: &str) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = self.stderr_tail(400);
        if tail.is_empty() {
            format!("{program} exited with {code}")
        } else {
            format!("{program} exited with {code}: {tail}")
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs an external program to completion.
///
/// Implementations must not block the async runtime; callers await the
/// result from a background task.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RunnerError>;
}

/// [`CommandRunner`] backed by `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RunnerError> {
        debug!(program, ?args, "running external command");
        let start = std::time::Instant::now();

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        if result.success() {
            debug!(program, duration_ms, "external command succeeded");
        } else {
            warn!(
                program,
                exit_code = ?result.exit_code,
                duration_ms,
                stderr = %result.stderr_tail(400),
                "external command failed"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_tokio_runner_captures_stdout() {
        let out = TokioCommandRunner
            .run("/bin/sh", &args(&["-c", "echo hello"]))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_tokio_runner_captures_exit_and_stderr() {
        let out = TokioCommandRunner
            .run("/bin/sh", &args(&["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_binary() {
        let err = TokioCommandRunner
            .run("/definitely/not/a/binary", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/definitely/not/a/binary"));
    }

    #[test]
    fn test_stderr_tail() {
        let out = CommandOutput::failed(1, "  abcdef\n");
        assert_eq!(out.stderr_tail(3), "def");
        assert_eq!(out.stderr_tail(100), "abcdef");
    }

    #[test]
    fn test_describe_failure() {
        assert_eq!(
            CommandOutput::failed(1, "").describe_failure("kind"),
            "kind exited with 1"
        );
        assert_eq!(
            CommandOutput::failed(2, "boom\n").describe_failure("kind"),
            "kind exited with 2: boom"
        );
        let killed = CommandOutput {
            exit_code: None,
            ..CommandOutput::default()
        };
        assert_eq!(killed.describe_failure("docker"), "docker exited with signal");
    }
}
