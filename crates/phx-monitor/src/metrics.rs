//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Resource monitor and metrics export utilities."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every metric family in the registry in the text exposition format.
pub fn render_text(registry: &Registry) -> Result<String> {
    Ok(TextEncoder::new().encode_to_string(&registry.gather())?)
}

/// Metrics recorded by the update orchestrator.
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    registry: SharedRegistry,
    runs: IntCounterVec,
    participant_failures: IntCounterVec,
    rollbacks: IntCounter,
    rollback_failures: IntCounterVec,
    last_run_seconds: Gauge,
}

impl PipelineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs = IntCounterVec::new(
            Opts::new(
                "phx_pipeline_runs_total",
                "Pipeline runs by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(runs.clone()))?;

        let participant_failures = IntCounterVec::new(
            Opts::new(
                "phx_participant_failures_total",
                "Participant failures by participant, phase and error kind",
            ),
            &["participant", "phase", "kind"],
        )?;
        registry.register(Box::new(participant_failures.clone()))?;

        let rollbacks = IntCounter::with_opts(Opts::new(
            "phx_rollbacks_total",
            "Rollbacks started, automatic or requested",
        ))?;
        registry.register(Box::new(rollbacks.clone()))?;

        let rollback_failures = IntCounterVec::new(
            Opts::new(
                "phx_rollback_failures_total",
                "Participants whose rollback step failed",
            ),
            &["participant"],
        )?;
        registry.register(Box::new(rollback_failures.clone()))?;

        let last_run_seconds = Gauge::with_opts(Opts::new(
            "phx_last_run_duration_seconds",
            "Wall time of the most recent update or rollback",
        ))?;
        registry.register(Box::new(last_run_seconds.clone()))?;

        Ok(Self {
            registry,
            runs,
            participant_failures,
            rollbacks,
            rollback_failures,
            last_run_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_run(&self, operation: &str, outcome: &str, duration: Duration) {
        self.runs.with_label_values(&[operation, outcome]).inc();
        self.last_run_seconds.set(duration.as_secs_f64());
    }

    pub fn record_participant_failure(&self, participant: &str, phase: &str, kind: &str) {
        self.participant_failures
            .with_label_values(&[participant, phase, kind])
            .inc();
    }

    pub fn record_rollback(&self) {
        self.rollbacks.inc();
    }

    pub fn record_rollback_failure(&self, participant: &str) {
        self.rollback_failures.with_label_values(&[participant]).inc();
    }

    pub fn runs(&self, operation: &str, outcome: &str) -> u64 {
        self.runs.with_label_values(&[operation, outcome]).get()
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.get()
    }
}
