//! OS command execution for provisioning
//!
//! Handles:
//! - Spawning commands with an optional stdin payload (e.g. `chpasswd`)
//! - Per-command timeout
//! - Redacting credential-bearing arguments from logs
//!
//! A non-zero exit status is not an error here; callers inspect
//! [`ExecutionResult::success`] and decide on fallbacks themselves.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

#[cfg(test)]
pub(crate) mod fake;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command line to run, plus optional stdin
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Arguments or stdin carry a credential and must not be logged
    pub sensitive: bool,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            sensitive: false,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Prefix the command with `sudo`
    pub fn elevated(self) -> Self {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
            ..self
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            write!(f, "{} <redacted>", self.program)
        } else {
            write!(f, "{}", self.program)?;
            for arg in &self.args {
                write!(f, " {}", arg)?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandSpec({})", self)
    }
}

/// Command execution result
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl ExecutionResult {
    /// First line of stdout, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError>;
}

/// Runs commands on the host with tokio::process
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, CommandError> {
        let start_time = Instant::now();
        debug!(command = %spec, timeout_secs = self.timeout.as_secs(), "Executing command");

        let mut command = AsyncCommand::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|source| CommandError::Io {
                    program: spec.program.clone(),
                    source,
                })?;
            // Dropping stdin closes the pipe so the child sees EOF
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::TimedOut {
                program: spec.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?;

        let result = ExecutionResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        };

        debug!(
            command = %spec,
            exit_code = ?result.exit_code,
            elapsed_ms = result.execution_time_ms,
            "Command finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_and_redacted_display() {
        let spec = CommandSpec::new("hostnamectl", ["set-hostname", "vm-42"]).elevated();
        assert_eq!(spec.program, "sudo");
        assert_eq!(spec.args, vec!["hostnamectl", "set-hostname", "vm-42"]);
        assert_eq!(spec.to_string(), "sudo hostnamectl set-hostname vm-42");

        let secret = CommandSpec::new("net", ["user", "administrator", "hunter2"]).sensitive();
        assert_eq!(secret.to_string(), "net <redacted>");
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_execution() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let result = runner
            .run(&CommandSpec::new("echo", ["Hello World"]))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.first_line(), "Hello World");
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let result = runner
            .run(&CommandSpec::new("cat", Vec::<String>::new()).with_stdin("root:secret"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout, "root:secret");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let result = runner
            .run(&CommandSpec::new("sh", ["-c", "exit 3"]))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let runner = SystemCommandRunner::new(Duration::from_millis(200));
        let err = runner
            .run(&CommandSpec::new("sleep", ["10"]))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-4711", Vec::<String>::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
