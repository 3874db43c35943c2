//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant contract and pipeline data model."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fmt;

use phx_process::ProcessError;
use serde::{Deserialize, Serialize};

/// Result alias used by participants and collaborators.
pub type Result<T> = std::result::Result<T, UpdateError>;

/// Failure taxonomy shared by every pipeline component.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// A required external tool is missing or unusable.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The target ref or working copy is not in the expected state.
    #[error("invalid state: {0}")]
    State(String),
    /// Insufficient disk space, memory, or permissions.
    #[error("insufficient resources: {0}")]
    Resource(String),
    /// An external process failed or timed out.
    #[error("execution of `{command}` failed: {reason}")]
    Execution {
        /// Rendered command line.
        command: String,
        /// Failure description.
        reason: String,
    },
    /// A post-update health check did not pass.
    #[error("verification failed: {0}")]
    Verification(String),
    /// A regression suite reported failure.
    #[error("tests failed: {0}")]
    TestFailure(String),
    /// Another update or rollback is already running on this orchestrator.
    #[error("an update or rollback is already in progress")]
    Busy,
    /// Local filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discriminant of [`UpdateError`], used for labels and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    State,
    Resource,
    Execution,
    Verification,
    TestFailure,
    Busy,
    Io,
}

impl ErrorKind {
    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::State => "state",
            ErrorKind::Resource => "resource",
            ErrorKind::Execution => "execution",
            ErrorKind::Verification => "verification",
            ErrorKind::TestFailure => "test_failure",
            ErrorKind::Busy => "busy",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UpdateError {
    /// Build an execution error from any displayable reason.
    pub fn execution(command: impl Into<String>, reason: impl fmt::Display) -> Self {
        UpdateError::Execution {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Validation(_) => ErrorKind::Validation,
            UpdateError::State(_) => ErrorKind::State,
            UpdateError::Resource(_) => ErrorKind::Resource,
            UpdateError::Execution { .. } => ErrorKind::Execution,
            UpdateError::Verification(_) => ErrorKind::Verification,
            UpdateError::TestFailure(_) => ErrorKind::TestFailure,
            UpdateError::Busy => ErrorKind::Busy,
            UpdateError::Io(_) => ErrorKind::Io,
        }
    }

    /// Errors of this class are raised by pre-flight checks, before anything
    /// has been mutated.
    pub fn aborts_before_mutation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::State | ErrorKind::Resource
        )
    }
}

impl From<ProcessError> for UpdateError {
    fn from(err: ProcessError) -> Self {
        let command = err.command().to_owned();
        let reason = match &err {
            ProcessError::Spawn { source, .. } => format!("could not start: {source}"),
            ProcessError::TimedOut { timeout, .. } => format!("timed out after {timeout:?}"),
            ProcessError::NonZeroExit { status, stderr, .. } => {
                format!("exit status {status}: {stderr}")
            }
        };
        UpdateError::Execution { command, reason }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn process_timeout_maps_to_execution_error() {
        let err: UpdateError = ProcessError::TimedOut {
            command: "docker build .".into(),
            timeout: Duration::from_secs(2),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("docker build ."));
        assert!(err.to_string().contains("timed out"));
        assert!(!err.aborts_before_mutation());
    }

    #[test]
    fn preflight_classes_abort_before_mutation() {
        assert!(UpdateError::Validation("git missing".into()).aborts_before_mutation());
        assert!(UpdateError::State("no branch".into()).aborts_before_mutation());
        assert!(UpdateError::Resource("disk full".into()).aborts_before_mutation());
        assert!(!UpdateError::Verification("not running".into()).aborts_before_mutation());
        assert!(!UpdateError::TestFailure("2 failed".into()).aborts_before_mutation());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ErrorKind::TestFailure.to_string(), "test_failure");
        assert_eq!(UpdateError::Busy.kind().as_str(), "busy");
    }
}
