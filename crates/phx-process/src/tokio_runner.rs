//! ---
//! phx_section: "02-process-execution"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Narrow capability for invoking external tools."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{ProcessError, ProcessOutput, ProcessRequest, ProcessRunner, Result};

/// Runner backed by `tokio::process`. Children are killed when their timeout elapses.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    default_timeout: Duration,
}

impl TokioProcessRunner {
    /// Construct a runner applying `default_timeout` to requests without their own.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Timeout applied when a request does not override it.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(crate::DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput> {
        let command_line = request.command_line();
        let limit = request.timeout.unwrap_or(self.default_timeout);

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.cwd {
            command.current_dir(dir);
        }

        debug!(command = %command_line, timeout_secs = limit.as_secs(), "spawning process");
        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProcessError::Spawn {
                command: command_line.clone(),
                source,
            })?,
            Err(_) => {
                warn!(command = %command_line, timeout_secs = limit.as_secs(), "process timed out");
                return Err(ProcessError::TimedOut {
                    command: command_line,
                    timeout: limit,
                });
            }
        };

        let result = ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %command_line, status = ?result.status, "process finished");
        Ok(result)
    }
}
