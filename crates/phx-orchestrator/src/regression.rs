//! ---
//! phx_section: "15-testing-qa-runbook"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Regression suites executed around the apply phase."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use phx_common::{CommandSpec, TestsConfig};
use phx_core::{Result, TestReport, TestRunner};
use phx_process::{ProcessRequest, ProcessRunner};
use tracing::info;

/// Lines of output kept in a failing report.
const TAIL_LINES: usize = 20;

/// [`TestRunner`] executing the suites configured under `[tests]`.
///
/// A suite that is not configured passes. A suite that exits non-zero yields a
/// failed report; one that cannot be started or times out is an error.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    config: TestsConfig,
    runner: Arc<dyn ProcessRunner>,
    default_timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(config: TestsConfig, runner: Arc<dyn ProcessRunner>, default_timeout: Duration) -> Self {
        Self {
            config,
            runner,
            default_timeout,
        }
    }

    async fn run_suite(&self, suite: &str, spec: Option<&CommandSpec>) -> Result<TestReport> {
        let Some(spec) = spec else {
            return Ok(TestReport::passed(format!("no {suite} suite configured")));
        };
        let mut request = ProcessRequest::new(&spec.program)
            .args(&spec.args)
            .timeout(spec.timeout.unwrap_or(self.default_timeout));
        if let Some(cwd) = &spec.cwd {
            request = request.current_dir(cwd);
        }
        let command = request.command_line();
        info!(suite, command = %command, "running regression suite");

        let output = self.runner.run(&request).await?;
        if output.success() {
            return Ok(TestReport::passed(format!("{suite} suite passed: {command}")));
        }
        let status = output
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_owned());
        let detail = tail(if output.stderr.trim().is_empty() {
            &output.stdout
        } else {
            &output.stderr
        });
        Ok(TestReport::failed(format!(
            "{suite} suite `{command}` exited with status {status}: {detail}"
        )))
    }
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_pre_update_tests(&self) -> Result<TestReport> {
        self.run_suite("pre-update", self.config.pre_update.as_ref())
            .await
    }

    async fn run_post_update_tests(&self) -> Result<TestReport> {
        self.run_suite("post-update", self.config.post_update.as_ref())
            .await
    }

    async fn run_post_rollback_tests(&self) -> Result<TestReport> {
        self.run_suite("post-rollback", self.config.post_rollback.as_ref())
            .await
    }
}
