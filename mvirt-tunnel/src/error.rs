//! Errors surfaced by the reconciliation engine.

use std::fmt;

use thiserror::Error;

use crate::command::Argv;
use crate::engine::PlanStep;
use crate::store::StoreError;
use crate::validation::ValidationErrors;

/// A plan step whose command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub step: PlanStep,
    pub command: Argv,
    pub exit_code: Option<i32>,
    /// Trimmed combined output of the command.
    pub output: String,
    pub timed_out: bool,
}

impl CommandFailure {
    /// Failure text without the command line.
    pub fn public_message(&self) -> String {
        if self.timed_out {
            return format!("Failed to {}: command timed out", self.step);
        }
        if self.output.is_empty() {
            format!("Failed to {}", self.step)
        } else {
            format!("Failed to {}: {}", self.step, self.output)
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed: `{}`", self.step, self.command)?;
        match (self.timed_out, self.exit_code) {
            (true, _) => write!(f, " timed out")?,
            (false, Some(code)) => write!(f, " exited with {}", code)?,
            (false, None) => write!(f, " did not run")?,
        }
        if !self.output.is_empty() {
            write!(f, ": {}", self.output)?;
        }
        Ok(())
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("interface name '{0}' is already in use")]
    Conflict(String),

    #[error("tunnel not found: {0}")]
    NotFound(String),

    /// Another operation held the interface lock for longer than the lock timeout.
    #[error("interface {0} is busy")]
    Busy(String),

    #[error("{0}")]
    Command(CommandFailure),

    #[error("{failure} (after {} completed step(s), {})", .completed.len(), rollback_note(.compensated))]
    PartialFailure {
        failure: CommandFailure,
        completed: Vec<PlanStep>,
        compensated: bool,
    },

    #[error("operation on {interface} cancelled before step '{step}'")]
    Cancelled {
        interface: String,
        step: PlanStep,
        compensated: bool,
    },

    #[error("store error: {0}")]
    Store(StoreError),
}

fn rollback_note(compensated: &bool) -> &'static str {
    if *compensated {
        "rolled back"
    } else {
        "rollback failed"
    }
}

impl From<StoreError> for TunnelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TunnelError::NotFound(id),
            StoreError::Conflict { interface_name, .. } => TunnelError::Conflict(interface_name),
            other => TunnelError::Store(other),
        }
    }
}

impl TunnelError {
    /// The plan step that failed, for command errors.
    pub fn failed_step(&self) -> Option<PlanStep> {
        match self {
            TunnelError::Command(failure) | TunnelError::PartialFailure { failure, .. } => {
                Some(failure.step)
            }
            TunnelError::Cancelled { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Caller-facing message. Command lines and storage internals are left out.
    pub fn public_message(&self) -> String {
        match self {
            TunnelError::Command(failure) => failure.public_message(),
            TunnelError::PartialFailure {
                failure,
                compensated,
                ..
            } => {
                if *compensated {
                    format!("{}. Partial changes were rolled back.", failure.public_message())
                } else {
                    format!(
                        "{}. Rolling back partial changes failed, the interface may need manual cleanup.",
                        failure.public_message()
                    )
                }
            }
            TunnelError::Cancelled { .. } => "Operation was cancelled".to_string(),
            TunnelError::Store(_) => "Internal storage error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the caller can fix this by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TunnelError::Validation(_) | TunnelError::Conflict(_) | TunnelError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> CommandFailure {
        CommandFailure {
            step: PlanStep::AssignAddress,
            command: Argv::new("ip", ["addr", "add", "fd00::1/64", "dev", "gre1"]),
            exit_code: Some(2),
            output: "RTNETLINK answers: Permission denied".to_string(),
            timed_out: false,
        }
    }

    #[test]
    fn test_display_carries_command() {
        let msg = TunnelError::Command(failure()).to_string();
        assert!(msg.contains("ip addr add fd00::1/64 dev gre1"));
        assert!(msg.contains("exited with 2"));
    }

    #[test]
    fn test_public_message_hides_command() {
        let err = TunnelError::PartialFailure {
            failure: failure(),
            completed: vec![PlanStep::CreateInterface],
            compensated: true,
        };
        let msg = err.public_message();
        assert!(!msg.contains("ip addr add"));
        assert!(msg.contains("assign address"));
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("rolled back"));
        assert_eq!(err.failed_step(), Some(PlanStep::AssignAddress));
    }

    #[test]
    fn test_timeout_message() {
        let mut failure = failure();
        failure.timed_out = true;
        failure.exit_code = None;
        assert_eq!(
            failure.public_message(),
            "Failed to assign address: command timed out"
        );
        assert!(failure.to_string().contains("timed out"));
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let err: TunnelError = StoreError::Conflict {
            interface_name: "sit1".to_string(),
            holder: "abc".to_string(),
        }
        .into();
        assert!(matches!(err, TunnelError::Conflict(ref name) if name == "sit1"));
        assert!(err.is_client_error());

        let err: TunnelError = StoreError::NotFound("abc".to_string()).into();
        assert!(matches!(err, TunnelError::NotFound(_)));

        let err: TunnelError = StoreError::Corrupt {
            id: "abc".to_string(),
            reason: "bad kind".to_string(),
        }
        .into();
        assert_eq!(err.public_message(), "Internal storage error");
        assert!(!err.is_client_error());
    }
}
