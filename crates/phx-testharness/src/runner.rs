//! ---
//! phx_section: "15-testing-qa-runbook"
//! phx_subsection: "harness"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Test doubles for the process runner and participants."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use phx_process::{ProcessError, ProcessOutput, ProcessRequest, ProcessRunner, Result};
use tracing::debug;

/// Canned response for a scripted command.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return this output.
    Output(ProcessOutput),
    /// Fail as if the timeout elapsed.
    Timeout,
    /// Fail as if the program could not be spawned.
    SpawnError,
}

impl From<ProcessOutput> for Scripted {
    fn from(output: ProcessOutput) -> Self {
        Scripted::Output(output)
    }
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    /// Consumed front to back; the last response repeats.
    responses: VecDeque<Scripted>,
}

/// Fake [`ProcessRunner`] answering command lines from a script.
///
/// A request matches the rule with the longest prefix of its rendered command
/// line. Unmatched commands exit with status 127 so a missing script entry
/// shows up as a failure rather than a silent success.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ProcessRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix` with `response`.
    pub fn on(&self, prefix: impl Into<String>, response: impl Into<Scripted>) -> &Self {
        self.on_sequence(prefix, vec![response.into()])
    }

    /// Answer successive matching commands with `responses`, repeating the last.
    pub fn on_sequence(&self, prefix: impl Into<String>, responses: Vec<Scripted>) -> &Self {
        let prefix = prefix.into();
        let mut rules = self.rules.lock();
        rules.retain(|rule| rule.prefix != prefix);
        rules.push(Rule {
            prefix,
            responses: responses.into(),
        });
        self
    }

    /// Command lines received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(ProcessRequest::command_line)
            .collect()
    }

    /// Full requests received so far, in order.
    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.calls.lock().clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Whether any received command starts with `prefix`.
    pub fn was_called(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    fn respond(&self, line: &str) -> Option<Scripted> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .filter(|rule| line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())?;
        if rule.responses.len() > 1 {
            rule.responses.pop_front()
        } else {
            rule.responses.front().cloned()
        }
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput> {
        let line = request.command_line();
        self.calls.lock().push(request.clone());
        debug!(command = %line, "scripted process invocation");
        match self.respond(&line) {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Timeout) => Err(ProcessError::TimedOut {
                command: line,
                timeout: request.timeout.unwrap_or(Duration::from_secs(1)),
            }),
            Some(Scripted::SpawnError) => Err(ProcessError::Spawn {
                command: line,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
            None => Ok(ProcessOutput::failed(127, format!("unscripted command: {line}"))),
        }
    }
}
