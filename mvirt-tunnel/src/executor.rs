//! Command execution.
//!
//! The executor is the only component that touches the host. A non-zero exit,
//! a spawn failure and a timeout are all reported as an unsuccessful
//! [`CommandOutput`]; `execute` itself never fails.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::command::Argv;
use crate::config::ExecutorConfig;

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub succeeded: bool,
    /// Combined stdout and stderr.
    pub output: String,
    /// `None` if the process never exited on its own (spawn failure, timeout, signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            exit_code: Some(0),
            timed_out: false,
        }
    }

    pub fn failure(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output: output.into(),
            exit_code,
            timed_out: false,
        }
    }

    pub fn timeout(output: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output: output.into(),
            exit_code: None,
            timed_out: true,
        }
    }
}

/// Runs one fully rendered command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, argv: &Argv) -> CommandOutput;
}

/// Error texts are matched in English.
const C_LOCALE: &str = "LC_ALL=C";

/// Executor that spawns real processes with `tokio::process`.
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn command(&self, argv: &Argv) -> Command {
        let mut cmd = if self.config.sudo {
            // -n: never prompt, fail instead. sudo resets the environment,
            // so the locale is set again on the far side.
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "env", C_LOCALE]).arg(&argv.program);
            cmd
        } else {
            let mut cmd = Command::new(&argv.program);
            cmd.env("LC_ALL", "C");
            cmd
        };
        cmd.args(&argv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, argv: &Argv) -> CommandOutput {
        debug!(command = %argv, "Executing command");

        let mut cmd = self.command(argv);
        let output = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Err(_) => {
                // Dropping the future kills the child (kill_on_drop)
                warn!(command = %argv, timeout = ?self.config.timeout, "Command timed out");
                return CommandOutput::timeout(format!(
                    "{} timed out after {:?}",
                    argv.program, self.config.timeout
                ));
            }
            Ok(Err(e)) => {
                warn!(command = %argv, error = %e, "Failed to spawn command");
                return CommandOutput::failure(None, format!("Failed to run {}: {}", argv.program, e));
            }
            Ok(Ok(output)) => output,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        if output.status.success() {
            CommandOutput::success(text)
        } else {
            debug!(command = %argv, status = %output.status, "Command failed");
            CommandOutput::failure(output.status.code(), text)
        }
    }
}
