//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Scoped logging adapters and lifecycle events."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Every participant and the orchestrator log through a [`ScopedLogger`]
//! tagged with their own scope name. Routing lines to per-scope files is left
//! to the installed subscriber.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Scope (participant or component) emitting the event.
    pub scope: Option<&'a str>,
    /// Pipeline phase the event belongs to.
    pub phase: Option<&'a str>,
    /// Run identifier, when emitted inside an orchestrator run.
    pub run_id: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a scope name.
    pub fn with_scope(mut self, scope: &'a str) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Attach a pipeline phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Attach a run identifier.
    pub fn with_run(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Logger handed to each pipeline component, tagging every line with its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedLogger {
    scope: String,
}

impl ScopedLogger {
    /// Create a logger for the named scope.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Scope attached to every event.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Informational progress message.
    pub fn info(&self, message: impl AsRef<str>) {
        tracing::info!(scope = %self.scope, outcome = "progress", message = %message.as_ref());
    }

    /// Recoverable condition worth surfacing to operators.
    pub fn warn(&self, message: impl AsRef<str>) {
        tracing::warn!(scope = %self.scope, outcome = "warning", message = %message.as_ref());
    }

    /// Failure with optional detail (typically the rendered error).
    pub fn error(&self, message: impl AsRef<str>, detail: Option<&str>) {
        tracing::error!(
            scope = %self.scope,
            outcome = "fault",
            detail = detail.unwrap_or(""),
            message = %message.as_ref()
        );
    }

    /// Completion of a step.
    pub fn success(&self, message: impl AsRef<str>) {
        tracing::info!(scope = %self.scope, outcome = "success", message = %message.as_ref());
    }
}

/// High-level outcome used when emitting pipeline lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation completed in a degraded state.
    Degraded,
    /// The operation failed or was aborted.
    Fault,
}

impl PipelineEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            PipelineEventOutcome::Success => "success",
            PipelineEventOutcome::Degraded => "degraded",
            PipelineEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event with a success/degraded/fault outcome.
pub fn log_pipeline_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: PipelineEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let scope = ctx.scope.unwrap_or("");
    let phase = ctx.phase.unwrap_or("");
    let run_id = ctx.run_id.unwrap_or("");
    // `tracing::event!` needs a constant level, hence the explicit match.
    match outcome {
        PipelineEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            scope,
            phase,
            run_id,
            message = %message
        ),
        PipelineEventOutcome::Degraded => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            scope,
            phase,
            run_id,
            message = %message
        ),
        PipelineEventOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            scope,
            phase,
            run_id,
            message = %message
        ),
    }
}
