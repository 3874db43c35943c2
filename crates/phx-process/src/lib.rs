//! ---
//! phx_section: "02-process-execution"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Narrow capability for invoking external tools."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Every participant talks to git, the container runtime, or a test command
//! through [`ProcessRunner`]. Production code uses [`TokioProcessRunner`];
//! tests substitute a scripted fake.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

mod tokio_runner;

pub use tokio_runner::TokioProcessRunner;

/// Default timeout applied when a request does not carry its own.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Result alias used throughout the process crate.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Failures raised while invoking an external process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all (missing binary, permissions).
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The program did not finish within the allotted time and was killed.
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut {
        /// Rendered command line.
        command: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The program finished with a non-zero (or signal) exit status.
    #[error("`{command}` exited with status {status}: {stderr}")]
    NonZeroExit {
        /// Rendered command line.
        command: String,
        /// Exit code, or `signal` when terminated by a signal.
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },
}

impl ProcessError {
    /// Rendered command line associated with the failure.
    pub fn command(&self) -> &str {
        match self {
            ProcessError::Spawn { command, .. }
            | ProcessError::TimedOut { command, .. }
            | ProcessError::NonZeroExit { command, .. } => command,
        }
    }

    /// Whether the failure was caused by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::TimedOut { .. })
    }
}

/// Description of a single external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Program to execute (resolved through `PATH`).
    pub program: String,
    /// Arguments passed verbatim, no shell interpretation.
    pub args: Vec<String>,
    /// Working directory, inherits the caller's when unset.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Per-invocation timeout; runners fall back to their default when unset.
    pub timeout: Option<Duration>,
}

impl ProcessRequest {
    /// Start building a request for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run inside the supplied directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the timeout for this invocation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Render the command line for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for ProcessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

impl ProcessOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed standard output.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Capability for running external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync + fmt::Debug {
    /// Run the request to completion. Non-zero exits are reported through
    /// [`ProcessOutput::status`], not as errors.
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput>;
}

/// Run the request and turn an unsuccessful exit into [`ProcessError::NonZeroExit`].
pub async fn run_checked(
    runner: &dyn ProcessRunner,
    request: &ProcessRequest,
) -> Result<ProcessOutput> {
    let output = runner.run(request).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ProcessError::NonZeroExit {
            command: request.command_line(),
            status: output
                .status
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_owned()),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
