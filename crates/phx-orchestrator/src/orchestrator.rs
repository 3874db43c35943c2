//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Primary orchestration and lifecycle management."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! The update pipeline: concurrent check, then sequential precheck, backup and
//! apply across participants, with reverse-order rollback of everything
//! applied before a failure.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use phx_common::VersionInfo;
use phx_core::{
    ErrorKind, IntegrityReport, MonitorReport, NoopMonitor, NoopStore, NoopTestRunner,
    ParticipantHandle, ParticipantRecord, PersistentStore, ResourceMonitor, RunOperation,
    RunRecord, TestReport, TestRunner, UpdateError, UpdateInfo, UpdateOptions, UpdateResult,
};
use phx_logging::{log_pipeline_event, phx_warn, LogContext, PipelineEventOutcome, ScopedLogger};
use phx_monitor::PipelineMetrics;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::registry::ParticipantRegistry;

const SCOPE: &str = "orchestrator";
const STORE_PARTICIPANT: &str = "persistent_store";

/// Observable position of the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Checking,
    Precheck,
    Backup,
    /// Applying the participant at this index of the active order.
    Apply(usize),
    Verify,
    Done,
    RollingBack,
    RolledBack,
    Failed,
}

impl PipelineState {
    /// Label without the participant index, used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Checking => "checking",
            PipelineState::Precheck => "precheck",
            PipelineState::Backup => "backup",
            PipelineState::Apply(_) => "apply",
            PipelineState::Verify => "verify",
            PipelineState::Done => "done",
            PipelineState::RollingBack => "rolling_back",
            PipelineState::RolledBack => "rolled_back",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Apply(index) => write!(f, "apply[{index}]"),
            other => f.write_str(other.label()),
        }
    }
}

/// Check result for one participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantCheck {
    pub participant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<UpdateInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of every participant's read-only check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckSummary {
    pub participants: Vec<ParticipantCheck>,
}

impl CheckSummary {
    pub fn has_updates(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Participants reporting an available update, in pipeline order.
    pub fn pending(&self) -> Vec<&str> {
        self.participants
            .iter()
            .filter(|check| check.info.as_ref().is_some_and(|info| info.has_update))
            .map(|check| check.participant.as_str())
            .collect()
    }

    /// `(participant, error)` for every check that failed.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.participants
            .iter()
            .filter_map(|check| {
                check
                    .error
                    .as_deref()
                    .map(|error| (check.participant.as_str(), error))
            })
            .collect()
    }
}

/// Result of one participant's apply step.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantOutcome {
    pub participant: String,
    pub result: UpdateResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Successful (possibly no-op) pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub success: bool,
    /// False when nothing was pending and the run was a no-op.
    pub updated: bool,
    pub check: CheckSummary,
    pub outcomes: Vec<ParticipantOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestReport>,
    pub monitoring: MonitorReport,
}

/// A participant whose rollback step failed.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackFailure {
    pub participant: String,
    pub kind: ErrorKind,
    pub error: String,
}

/// What an automatic or requested rollback did.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackSummary {
    pub run_id: String,
    /// Participants whose rollback ran, in the order it ran.
    pub attempted: Vec<String>,
    pub failures: Vec<RollbackFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_integrity: Option<IntegrityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestReport>,
    pub final_state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitorReport>,
}

impl RollbackSummary {
    /// Every participant rolled back, the store verified, and any tests passed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
            && self.store_integrity.as_ref().map_or(true, |report| report.ok)
            && self.tests.as_ref().map_or(true, |report| report.success)
    }
}

/// Everything known about a failed update.
#[derive(Debug)]
pub struct PipelineFailure {
    pub run_id: String,
    /// The original error; never replaced by a rollback error.
    pub error: UpdateError,
    /// State the pipeline was in when the error occurred.
    pub phase: PipelineState,
    pub participant: Option<String>,
    pub outcomes: Vec<ParticipantOutcome>,
    /// Present when the failure happened after mutation began.
    pub rollback: Option<RollbackSummary>,
    pub monitoring: MonitorReport,
}

impl PipelineFailure {
    pub fn final_state(&self) -> PipelineState {
        self.rollback
            .as_ref()
            .map_or(PipelineState::Failed, |summary| summary.final_state)
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update failed during {}", self.phase)?;
        if let Some(participant) = &self.participant {
            write!(f, " ({participant})")?;
        }
        write!(f, ": {}", self.error)?;
        match &self.rollback {
            Some(summary) if summary.is_clean() => write!(f, "; rolled back"),
            Some(summary) => write!(
                f,
                "; rollback incomplete ({} participant failure(s))",
                summary.failures.len()
            ),
            None => Ok(()),
        }
    }
}

/// Error returned by [`UpdateOrchestrator::update`] and [`UpdateOrchestrator::rollback`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("an update or rollback is already in progress")]
    Busy,
    #[error("{0}")]
    Failed(Box<PipelineFailure>),
}

struct Applied {
    updated: bool,
    check: CheckSummary,
    tests: Option<TestReport>,
}

struct Aborted {
    error: UpdateError,
    phase: PipelineState,
    participant: Option<String>,
    rollback: Option<RollbackSummary>,
}

impl Aborted {
    fn before_mutation(error: UpdateError, phase: PipelineState, participant: Option<&str>) -> Self {
        Self {
            error,
            phase,
            participant: participant.map(str::to_owned),
            rollback: None,
        }
    }
}

/// Drives registered participants through the update lifecycle.
#[derive(Debug)]
pub struct UpdateOrchestrator {
    registry: ParticipantRegistry,
    tests: Arc<dyn TestRunner>,
    monitor: Arc<dyn ResourceMonitor>,
    store: Arc<dyn PersistentStore>,
    metrics: Option<PipelineMetrics>,
    state: Mutex<PipelineState>,
    flight: tokio::sync::Mutex<()>,
    logger: ScopedLogger,
    version: VersionInfo,
}

impl UpdateOrchestrator {
    /// Orchestrator over `registry` with no-op collaborators.
    pub fn new(registry: ParticipantRegistry) -> Self {
        Self {
            registry,
            tests: Arc::new(NoopTestRunner),
            monitor: Arc::new(NoopMonitor),
            store: Arc::new(NoopStore),
            metrics: None,
            state: Mutex::new(PipelineState::Idle),
            flight: tokio::sync::Mutex::new(()),
            logger: ScopedLogger::new(SCOPE),
            version: VersionInfo::current(),
        }
    }

    pub fn with_test_runner(mut self, tests: Arc<dyn TestRunner>) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Whether an update or rollback currently holds the single-flight guard.
    pub fn is_busy(&self) -> bool {
        self.flight.try_lock().is_err()
    }

    fn set_state(&self, state: PipelineState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        debug!(from = %previous, to = %state, "pipeline state change");
    }

    fn active(&self, options: &UpdateOptions) -> Vec<ParticipantHandle> {
        self.registry
            .iter()
            .filter(|participant| !options.skips(participant.name()))
            .cloned()
            .collect()
    }

    /// Check every enabled participant concurrently. Never mutates anything,
    /// including the observable pipeline state.
    pub async fn check_for_updates(&self, options: &UpdateOptions) -> CheckSummary {
        self.check_all(&self.active(options), options).await
    }

    async fn check_all(&self, participants: &[ParticipantHandle], options: &UpdateOptions) -> CheckSummary {
        let checks = participants.iter().map(|participant| async move {
            (
                participant.name().to_owned(),
                participant.check_for_updates(options).await,
            )
        });
        let participants = join_all(checks)
            .await
            .into_iter()
            .map(|(participant, result)| match result {
                Ok(info) => ParticipantCheck {
                    participant,
                    info: Some(info),
                    error: None,
                },
                Err(err) => ParticipantCheck {
                    participant,
                    info: None,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        CheckSummary { participants }
    }

    /// Run the full pipeline. Rejected with [`PipelineError::Busy`] while
    /// another update or rollback is in flight on this orchestrator.
    pub async fn update(&self, options: &UpdateOptions) -> Result<PipelineReport, PipelineError> {
        let Ok(_flight) = self.flight.try_lock() else {
            self.logger.warn("update rejected: pipeline busy");
            return Err(PipelineError::Busy);
        };
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut session = self.monitor.start_update_monitoring();
        let mut outcomes = Vec::new();
        let result = self.run_update(&run_id, options, &mut outcomes).await;
        session.stop();
        let monitoring = session.results();
        let elapsed = clock.elapsed();
        let ctx = LogContext::new().with_scope(SCOPE).with_run(&run_id);

        match result {
            Ok(applied) => {
                self.set_state(PipelineState::Done);
                let message = if applied.updated {
                    format!("{} participant(s) updated", outcomes.len())
                } else {
                    "nothing to update".to_owned()
                };
                log_pipeline_event(Some(&ctx), "update", &message, PipelineEventOutcome::Success);
                self.record_metrics(
                    "update",
                    if applied.updated { "updated" } else { "noop" },
                    elapsed,
                );
                self.record_run(RunRecord {
                    run_id: run_id.clone(),
                    operation: RunOperation::Update,
                    started_at,
                    finished_at: Utc::now(),
                    success: true,
                    updated: applied.updated,
                    final_state: PipelineState::Done.label().to_owned(),
                    error: None,
                    participants: participant_records(&outcomes),
                    version: self.version.semver.clone(),
                })
                .await;
                Ok(PipelineReport {
                    run_id,
                    success: true,
                    updated: applied.updated,
                    check: applied.check,
                    outcomes,
                    tests: applied.tests,
                    monitoring,
                })
            }
            Err(aborted) => {
                if aborted.rollback.is_none() {
                    self.set_state(PipelineState::Failed);
                }
                let failure = PipelineFailure {
                    run_id: run_id.clone(),
                    error: aborted.error,
                    phase: aborted.phase,
                    participant: aborted.participant,
                    outcomes,
                    rollback: aborted.rollback,
                    monitoring,
                };
                let final_state = failure.final_state();
                let (outcome, metric) = match (&failure.rollback, final_state) {
                    (None, _) => (PipelineEventOutcome::Fault, "failed"),
                    (Some(_), PipelineState::RolledBack) => {
                        (PipelineEventOutcome::Degraded, "rolled_back")
                    }
                    (Some(_), _) => (PipelineEventOutcome::Fault, "rollback_failed"),
                };
                let message = failure.to_string();
                log_pipeline_event(Some(&ctx), "update", &message, outcome);
                self.logger.error(&message, Some(failure.error.kind().as_str()));
                self.record_metrics("update", metric, elapsed);
                self.record_run(RunRecord {
                    run_id,
                    operation: RunOperation::Update,
                    started_at,
                    finished_at: Utc::now(),
                    success: false,
                    updated: false,
                    final_state: final_state.label().to_owned(),
                    error: Some(failure.error.to_string()),
                    participants: participant_records(&failure.outcomes),
                    version: self.version.semver.clone(),
                })
                .await;
                Err(PipelineError::Failed(Box::new(failure)))
            }
        }
    }

    async fn run_update(
        &self,
        run_id: &str,
        options: &UpdateOptions,
        outcomes: &mut Vec<ParticipantOutcome>,
    ) -> Result<Applied, Aborted> {
        let ctx = LogContext::new().with_scope(SCOPE).with_run(run_id);
        let active = self.active(options);

        self.set_state(PipelineState::Checking);
        let check = self.check_all(&active, options).await;
        for (participant, error) in check.errors() {
            phx_warn!(context = ctx, "{participant} check failed, treated as no update: {error}");
        }
        if !check.has_updates() && !options.force {
            self.logger.info("no participant reports an update");
            return Ok(Applied {
                updated: false,
                check,
                tests: None,
            });
        }
        self.logger.info(format!(
            "updating {} participant(s); pending: [{}]",
            active.len(),
            check.pending().join(", ")
        ));

        self.set_state(PipelineState::Precheck);
        self.consult_collaborators(options)
            .await
            .map_err(|err| Aborted::before_mutation(err, PipelineState::Precheck, None))?;
        for participant in &active {
            if let Err(err) = participant.pre_update_check(options).await {
                self.note_failure(participant.name(), PipelineState::Precheck, &err);
                return Err(Aborted::before_mutation(
                    err,
                    PipelineState::Precheck,
                    Some(participant.name()),
                ));
            }
        }

        if options.skip_backup {
            self.logger.warn("backup phase skipped by request");
        } else {
            self.set_state(PipelineState::Backup);
            match self.store.create_backup().await {
                Ok(Some(path)) => self
                    .logger
                    .info(format!("store backed up to {}", path.display())),
                Ok(None) => debug!("store produced no backup artifact"),
                Err(err) => {
                    self.note_failure(STORE_PARTICIPANT, PipelineState::Backup, &err);
                    return Err(Aborted::before_mutation(
                        err,
                        PipelineState::Backup,
                        Some(STORE_PARTICIPANT),
                    ));
                }
            }
            for (index, participant) in active.iter().enumerate() {
                let Err(err) = participant.backup().await else {
                    continue;
                };
                self.note_failure(participant.name(), PipelineState::Backup, &err);
                if index == 0 {
                    return Err(Aborted::before_mutation(
                        err,
                        PipelineState::Backup,
                        Some(participant.name()),
                    ));
                }
                // Earlier backups may have touched the working copy (a stash).
                let rollback = self
                    .unwind(run_id, &active[..index], options.run_tests)
                    .await;
                return Err(Aborted {
                    error: err,
                    phase: PipelineState::Backup,
                    participant: Some(participant.name().to_owned()),
                    rollback: Some(rollback),
                });
            }
        }

        for (index, participant) in active.iter().enumerate() {
            let phase = PipelineState::Apply(index);
            self.set_state(phase);
            let name = participant.name().to_owned();
            let error = match participant.update(options).await {
                Ok(result) if result.success => {
                    self.logger.success(format!("{name}: {}", result.summary));
                    outcomes.push(ParticipantOutcome {
                        participant: name,
                        result,
                        error_kind: None,
                    });
                    continue;
                }
                Ok(result) => {
                    let error = UpdateError::Verification(format!(
                        "{name} reported an unsuccessful update: {}",
                        result.error.as_deref().unwrap_or(&result.summary)
                    ));
                    outcomes.push(ParticipantOutcome {
                        participant: name.clone(),
                        result,
                        error_kind: Some(error.kind()),
                    });
                    error
                }
                Err(error) => {
                    outcomes.push(ParticipantOutcome {
                        participant: name.clone(),
                        result: UpdateResult::failed(format!("{name} update failed"), error.to_string()),
                        error_kind: Some(error.kind()),
                    });
                    error
                }
            };
            self.note_failure(&name, phase, &error);
            // Participants after `index` never ran; `index` itself is not rolled back.
            let rollback = self
                .unwind(run_id, &active[..index], options.run_tests)
                .await;
            return Err(Aborted {
                error,
                phase,
                participant: Some(name),
                rollback: Some(rollback),
            });
        }

        let mut tests = None;
        if options.run_tests {
            self.set_state(PipelineState::Verify);
            let report = self
                .tests
                .run_post_update_tests()
                .await
                .unwrap_or_else(|err| TestReport::failed(err.to_string()));
            if !report.success {
                let error = UpdateError::TestFailure(report.summary);
                self.logger
                    .error("post-update tests failed", Some(&error.to_string()));
                let rollback = self.unwind(run_id, &active, true).await;
                return Err(Aborted {
                    error,
                    phase: PipelineState::Verify,
                    participant: None,
                    rollback: Some(rollback),
                });
            }
            tests = Some(report);
        }

        Ok(Applied {
            updated: true,
            check,
            tests,
        })
    }

    async fn consult_collaborators(&self, options: &UpdateOptions) -> phx_core::Result<()> {
        let status = self.store.check_status().await?;
        if !status.healthy {
            return Err(UpdateError::State(format!(
                "persistent store unhealthy: {}",
                status.detail
            )));
        }
        let resources = self.monitor.check_system_resources().await?;
        if !resources.sufficient {
            return Err(UpdateError::Resource(resources.detail));
        }
        debug!(detail = %resources.detail, "system resources sufficient");
        if options.run_tests {
            let report = self.tests.run_pre_update_tests().await?;
            if !report.success {
                return Err(UpdateError::TestFailure(report.summary));
            }
        }
        Ok(())
    }

    /// Roll back every enabled participant in reverse order. Individual
    /// failures are collected in the summary; the call itself only fails
    /// with [`PipelineError::Busy`].
    pub async fn rollback(&self, options: &UpdateOptions) -> Result<RollbackSummary, PipelineError> {
        let Ok(_flight) = self.flight.try_lock() else {
            self.logger.warn("rollback rejected: pipeline busy");
            return Err(PipelineError::Busy);
        };
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut session = self.monitor.start_rollback_monitoring();
        let active = self.active(options);
        let mut summary = self.unwind(&run_id, &active, options.run_tests).await;
        session.stop();
        summary.monitoring = Some(session.results());

        let clean = summary.is_clean();
        self.record_metrics(
            "rollback",
            if clean { "rolled_back" } else { "rollback_failed" },
            clock.elapsed(),
        );
        self.record_run(RunRecord {
            run_id,
            operation: RunOperation::Rollback,
            started_at,
            finished_at: Utc::now(),
            success: clean,
            updated: false,
            final_state: summary.final_state.label().to_owned(),
            error: (!clean).then(|| rollback_error(&summary)),
            participants: summary
                .attempted
                .iter()
                .map(|name| {
                    let failure = summary.failures.iter().find(|f| &f.participant == name);
                    ParticipantRecord {
                        name: name.clone(),
                        success: failure.is_none(),
                        error: failure.map(|f| f.error.clone()),
                    }
                })
                .collect(),
            version: self.version.semver.clone(),
        })
        .await;
        Ok(summary)
    }

    /// Rollback body shared by automatic and requested rollbacks. Assumes the
    /// caller holds the single-flight guard.
    async fn unwind(
        &self,
        run_id: &str,
        participants: &[ParticipantHandle],
        run_tests: bool,
    ) -> RollbackSummary {
        let ctx = LogContext::new()
            .with_scope(SCOPE)
            .with_phase("rollback")
            .with_run(run_id);
        self.set_state(PipelineState::RollingBack);
        if let Some(metrics) = &self.metrics {
            metrics.record_rollback();
        }

        let mut attempted = Vec::with_capacity(participants.len());
        let mut failures = Vec::new();
        for participant in participants.iter().rev() {
            let name = participant.name().to_owned();
            attempted.push(name.clone());
            match participant.rollback().await {
                Ok(()) => self.logger.info(format!("{name} rolled back")),
                Err(err) => {
                    self.logger
                        .error(format!("{name} rollback failed"), Some(&err.to_string()));
                    if let Some(metrics) = &self.metrics {
                        metrics.record_rollback_failure(&name);
                    }
                    failures.push(RollbackFailure {
                        participant: name,
                        kind: err.kind(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let store_integrity = match self.store.verify_integrity().await {
            Ok(report) => report,
            Err(err) => IntegrityReport {
                ok: false,
                records_checked: 0,
                corrupted: vec![err.to_string()],
            },
        };
        if !store_integrity.ok {
            phx_warn!(
                context = ctx,
                "store integrity check failed: {}",
                store_integrity.corrupted.join("; ")
            );
        }

        let tests = if run_tests {
            Some(
                self.tests
                    .run_post_rollback_tests()
                    .await
                    .unwrap_or_else(|err| TestReport::failed(err.to_string())),
            )
        } else {
            None
        };

        let mut summary = RollbackSummary {
            run_id: run_id.to_owned(),
            attempted,
            failures,
            store_integrity: Some(store_integrity),
            tests,
            final_state: PipelineState::RolledBack,
            monitoring: None,
        };
        if !summary.is_clean() {
            summary.final_state = PipelineState::Failed;
        }
        self.set_state(summary.final_state);
        let outcome = if summary.is_clean() {
            PipelineEventOutcome::Success
        } else {
            PipelineEventOutcome::Degraded
        };
        log_pipeline_event(
            Some(&ctx),
            "rollback",
            &format!(
                "rolled back [{}] with {} failure(s)",
                summary.attempted.join(", "),
                summary.failures.len()
            ),
            outcome,
        );
        summary
    }

    fn note_failure(&self, participant: &str, phase: PipelineState, error: &UpdateError) {
        self.logger.error(
            format!("{participant} failed during {phase}"),
            Some(&error.to_string()),
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_participant_failure(participant, phase.label(), error.kind().as_str());
        }
    }

    fn record_metrics(&self, operation: &str, outcome: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_run(operation, outcome, elapsed);
        }
    }

    async fn record_run(&self, record: RunRecord) {
        if let Err(err) = self.store.record_run(&record).await {
            self.logger
                .warn(format!("unable to record run {}: {err}", record.run_id));
        }
    }
}

fn participant_records(outcomes: &[ParticipantOutcome]) -> Vec<ParticipantRecord> {
    outcomes
        .iter()
        .map(|outcome| ParticipantRecord {
            name: outcome.participant.clone(),
            success: outcome.result.success,
            error: outcome.result.error.clone(),
        })
        .collect()
}

fn rollback_error(summary: &RollbackSummary) -> String {
    let mut problems: Vec<String> = summary
        .failures
        .iter()
        .map(|failure| format!("{}: {}", failure.participant, failure.error))
        .collect();
    if let Some(report) = summary.store_integrity.as_ref().filter(|report| !report.ok) {
        problems.push(format!("store: {}", report.corrupted.join("; ")));
    }
    if let Some(report) = summary.tests.as_ref().filter(|report| !report.success) {
        problems.push(format!("tests: {}", report.summary));
    }
    problems.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use phx_core::{ResourceStatus, StoreStatus};
    use phx_monitor::new_registry;
    use phx_testharness::{Journal, LifecyclePhase, RecordingParticipant};
    use std::path::PathBuf;

    fn orchestrator(participants: Vec<RecordingParticipant>) -> UpdateOrchestrator {
        let handles: Vec<ParticipantHandle> = participants
            .into_iter()
            .map(|participant| Arc::new(participant) as ParticipantHandle)
            .collect();
        UpdateOrchestrator::new(ParticipantRegistry::new(handles).unwrap())
    }

    fn three(journal: &Journal) -> Vec<RecordingParticipant> {
        ["snapshot", "source_sync", "container"]
            .into_iter()
            .map(|name| RecordingParticipant::new(name, journal.clone()))
            .collect()
    }

    fn failure(err: PipelineError) -> Box<PipelineFailure> {
        match err {
            PipelineError::Failed(failure) => failure,
            PipelineError::Busy => panic!("unexpected busy"),
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedCollaborators {
        unhealthy_store: bool,
        insufficient: bool,
        failing_post_update: bool,
        records: parking_lot::Mutex<Vec<RunRecord>>,
    }

    #[async_trait]
    impl PersistentStore for ScriptedCollaborators {
        async fn check_status(&self) -> phx_core::Result<StoreStatus> {
            Ok(StoreStatus {
                healthy: !self.unhealthy_store,
                detail: "scripted".into(),
            })
        }

        async fn create_backup(&self) -> phx_core::Result<Option<PathBuf>> {
            Ok(None)
        }

        async fn verify_integrity(&self) -> phx_core::Result<IntegrityReport> {
            Ok(IntegrityReport {
                ok: true,
                records_checked: self.records.lock().len(),
                corrupted: Vec::new(),
            })
        }

        async fn record_run(&self, record: &RunRecord) -> phx_core::Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ResourceMonitor for ScriptedCollaborators {
        async fn check_system_resources(&self) -> phx_core::Result<ResourceStatus> {
            Ok(ResourceStatus {
                sufficient: !self.insufficient,
                detail: "scripted".into(),
            })
        }

        fn start_update_monitoring(&self) -> Box<dyn phx_core::MonitorSession> {
            NoopMonitor.start_update_monitoring()
        }

        fn start_rollback_monitoring(&self) -> Box<dyn phx_core::MonitorSession> {
            NoopMonitor.start_rollback_monitoring()
        }
    }

    #[async_trait]
    impl TestRunner for ScriptedCollaborators {
        async fn run_pre_update_tests(&self) -> phx_core::Result<TestReport> {
            Ok(TestReport::passed("pre"))
        }

        async fn run_post_update_tests(&self) -> phx_core::Result<TestReport> {
            Ok(if self.failing_post_update {
                TestReport::failed("2 of 40 failed")
            } else {
                TestReport::passed("post")
            })
        }

        async fn run_post_rollback_tests(&self) -> phx_core::Result<TestReport> {
            Ok(TestReport::passed("rollback"))
        }
    }

    fn with_collaborators(
        participants: Vec<RecordingParticipant>,
        collaborators: Arc<ScriptedCollaborators>,
    ) -> UpdateOrchestrator {
        orchestrator(participants)
            .with_store(collaborators.clone())
            .with_monitor(collaborators.clone())
            .with_test_runner(collaborators)
    }

    #[tokio::test]
    async fn nothing_pending_is_a_noop() {
        let journal = Journal::new();
        let participants = three(&journal)
            .into_iter()
            .map(RecordingParticipant::without_update)
            .collect();
        let orchestrator = orchestrator(participants);

        let report = orchestrator.update(&UpdateOptions::default()).await.unwrap();
        assert!(report.success);
        assert!(!report.updated);
        assert!(report.outcomes.is_empty());
        assert!(journal.participants_for(LifecyclePhase::Backup).is_empty());
        assert!(journal.participants_for(LifecyclePhase::Update).is_empty());
        assert_eq!(orchestrator.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn force_runs_every_phase_in_order() {
        let journal = Journal::new();
        let participants = three(&journal)
            .into_iter()
            .map(RecordingParticipant::without_update)
            .collect();
        let orchestrator = orchestrator(participants);
        let options = UpdateOptions {
            force: true,
            ..UpdateOptions::default()
        };

        let report = orchestrator.update(&options).await.unwrap();
        assert!(report.updated);
        let sequential: Vec<String> = journal
            .entries()
            .into_iter()
            .filter(|entry| !entry.ends_with(":check"))
            .collect();
        assert_eq!(
            sequential,
            vec![
                "snapshot:precheck",
                "source_sync:precheck",
                "container:precheck",
                "snapshot:backup",
                "source_sync:backup",
                "container:backup",
                "snapshot:update",
                "source_sync:update",
                "container:update",
            ]
        );
    }

    #[tokio::test]
    async fn apply_failure_rolls_back_earlier_participants_in_reverse() {
        for k in 0..4 {
            let journal = Journal::new();
            let participants = ["p1", "p2", "p3", "p4"]
                .into_iter()
                .enumerate()
                .map(|(index, name)| {
                    let participant = RecordingParticipant::new(name, journal.clone());
                    if index == k {
                        participant.failing_on(LifecyclePhase::Update)
                    } else {
                        participant
                    }
                })
                .collect();
            let orchestrator = orchestrator(participants);

            let failure = failure(
                orchestrator
                    .update(&UpdateOptions::default())
                    .await
                    .unwrap_err(),
            );
            assert_eq!(failure.phase, PipelineState::Apply(k));
            let expected: Vec<String> = ["p1", "p2", "p3", "p4"][..k]
                .iter()
                .rev()
                .map(|name| name.to_string())
                .collect();
            assert_eq!(journal.participants_for(LifecyclePhase::Rollback), expected);
            let updated = journal.participants_for(LifecyclePhase::Update);
            assert_eq!(updated.len(), k + 1, "participants after the failure never run");
            assert_eq!(failure.rollback.as_ref().unwrap().attempted, expected);
            assert_eq!(failure.final_state(), PipelineState::RolledBack);
        }
    }

    #[tokio::test]
    async fn soft_failure_is_treated_as_apply_failure() {
        let journal = Journal::new();
        let mut participants = three(&journal);
        participants[2] = RecordingParticipant::new("container", journal.clone())
            .failing_on(LifecyclePhase::Update)
            .with_soft_failure();
        let orchestrator = orchestrator(participants);

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert!(matches!(failure.error, UpdateError::Verification(_)));
        assert_eq!(failure.outcomes.len(), 3);
        assert!(!failure.outcomes[2].result.success);
        assert_eq!(
            journal.participants_for(LifecyclePhase::Rollback),
            vec!["source_sync", "snapshot"]
        );
    }

    #[tokio::test]
    async fn precheck_failure_mutates_nothing() {
        let journal = Journal::new();
        let mut participants = three(&journal);
        participants[1] = RecordingParticipant::new("source_sync", journal.clone())
            .failing_on(LifecyclePhase::PreCheck);
        let orchestrator = orchestrator(participants);

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert_eq!(failure.phase, PipelineState::Precheck);
        assert!(failure.error.aborts_before_mutation());
        assert!(failure.rollback.is_none());
        assert_eq!(
            journal.participants_for(LifecyclePhase::PreCheck),
            vec!["snapshot", "source_sync"]
        );
        assert!(journal.participants_for(LifecyclePhase::Backup).is_empty());
        assert!(journal.participants_for(LifecyclePhase::Update).is_empty());
        assert!(journal.participants_for(LifecyclePhase::Rollback).is_empty());
        assert_eq!(orchestrator.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn backup_failure_unwinds_participants_already_backed_up() {
        let journal = Journal::new();
        let mut participants = three(&journal);
        participants[2] = RecordingParticipant::new("container", journal.clone())
            .failing_on(LifecyclePhase::Backup);
        let orchestrator = orchestrator(participants);

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert_eq!(failure.phase, PipelineState::Backup);
        assert_eq!(failure.participant.as_deref(), Some("container"));
        assert!(journal.participants_for(LifecyclePhase::Update).is_empty());
        assert_eq!(
            journal.participants_for(LifecyclePhase::Rollback),
            vec!["source_sync", "snapshot"]
        );
        assert_eq!(failure.final_state(), PipelineState::RolledBack);
        assert_eq!(orchestrator.state(), PipelineState::RolledBack);
    }

    #[tokio::test]
    async fn first_backup_failure_needs_no_rollback() {
        let journal = Journal::new();
        let mut participants = three(&journal);
        participants[0] = RecordingParticipant::new("snapshot", journal.clone())
            .failing_on(LifecyclePhase::Backup);
        let orchestrator = orchestrator(participants);

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert_eq!(failure.phase, PipelineState::Backup);
        assert!(failure.rollback.is_none());
        assert_eq!(journal.participants_for(LifecyclePhase::Backup), vec!["snapshot"]);
        assert!(journal.participants_for(LifecyclePhase::Rollback).is_empty());
        assert_eq!(orchestrator.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn rollback_failures_are_collected_without_masking_the_cause() {
        let journal = Journal::new();
        let participants = vec![
            RecordingParticipant::new("snapshot", journal.clone())
                .failing_on(LifecyclePhase::Rollback),
            RecordingParticipant::new("source_sync", journal.clone()),
            RecordingParticipant::new("container", journal.clone())
                .failing_on(LifecyclePhase::Update),
        ];
        let metrics = PipelineMetrics::new(new_registry()).unwrap();
        let orchestrator = orchestrator(participants).with_metrics(metrics.clone());

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert!(matches!(failure.error, UpdateError::Verification(_)));
        let rollback = failure.rollback.as_ref().unwrap();
        assert_eq!(rollback.attempted, vec!["source_sync", "snapshot"]);
        assert_eq!(rollback.failures.len(), 1);
        assert_eq!(rollback.failures[0].participant, "snapshot");
        assert_eq!(failure.final_state(), PipelineState::Failed);
        assert_eq!(metrics.runs("update", "rollback_failed"), 1);
        assert_eq!(metrics.rollbacks(), 1);
    }

    #[tokio::test]
    async fn rollback_twice_never_errors() {
        let journal = Journal::new();
        let participants = vec![
            RecordingParticipant::new("snapshot", journal.clone())
                .failing_on(LifecyclePhase::Rollback),
            RecordingParticipant::new("source_sync", journal.clone()),
        ];
        let orchestrator = orchestrator(participants);

        let first = orchestrator.rollback(&UpdateOptions::default()).await.unwrap();
        let second = orchestrator.rollback(&UpdateOptions::default()).await.unwrap();
        assert_eq!(first.attempted, vec!["source_sync", "snapshot"]);
        assert_eq!(second.failures.len(), 1);
        assert!(second.monitoring.is_some());
        assert_eq!(orchestrator.state(), PipelineState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_calls_are_rejected_as_busy() {
        let journal = Journal::new();
        let participants = vec![RecordingParticipant::new("slow", journal.clone())
            .with_update_delay(Duration::from_millis(300))];
        let orchestrator = Arc::new(orchestrator(participants));

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.update(&UpdateOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(orchestrator.is_busy());
        assert!(matches!(
            orchestrator.update(&UpdateOptions::default()).await,
            Err(PipelineError::Busy)
        ));
        assert!(matches!(
            orchestrator.rollback(&UpdateOptions::default()).await,
            Err(PipelineError::Busy)
        ));
        let summary = orchestrator
            .check_for_updates(&UpdateOptions::default())
            .await;
        assert_eq!(summary.pending(), vec!["slow"]);

        assert!(running.await.unwrap().is_ok());
        assert!(!orchestrator.is_busy());
        assert_eq!(journal.participants_for(LifecyclePhase::Update).len(), 1);
    }

    #[tokio::test]
    async fn skipped_participants_take_no_part() {
        let journal = Journal::new();
        let orchestrator = orchestrator(three(&journal));
        let mut options = UpdateOptions {
            skip_backup: true,
            skip_container_redeploy: true,
            ..UpdateOptions::default()
        };
        options.skip_participants.insert("snapshot".into());

        let report = orchestrator.update(&options).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(
            journal.entries(),
            vec!["source_sync:check", "source_sync:precheck", "source_sync:update"]
        );
    }

    #[tokio::test]
    async fn check_errors_count_as_no_update() {
        let journal = Journal::new();
        let participants = vec![
            RecordingParticipant::new("flaky", journal.clone()).failing_on(LifecyclePhase::Check),
            RecordingParticipant::new("idle", journal.clone()).without_update(),
        ];
        let orchestrator = orchestrator(participants);

        let summary = orchestrator
            .check_for_updates(&UpdateOptions::default())
            .await;
        assert_eq!(summary.errors().len(), 1);
        assert!(!summary.has_updates());
        assert_eq!(orchestrator.state(), PipelineState::Idle);

        let report = orchestrator.update(&UpdateOptions::default()).await.unwrap();
        assert!(!report.updated);
    }

    #[tokio::test]
    async fn unhealthy_collaborators_abort_before_participant_prechecks() {
        let journal = Journal::new();
        let collaborators = Arc::new(ScriptedCollaborators {
            insufficient: true,
            ..ScriptedCollaborators::default()
        });
        let orchestrator = with_collaborators(three(&journal), collaborators.clone());

        let failure = failure(
            orchestrator
                .update(&UpdateOptions::default())
                .await
                .unwrap_err(),
        );
        assert!(matches!(failure.error, UpdateError::Resource(_)));
        assert!(journal.participants_for(LifecyclePhase::PreCheck).is_empty());
        let records = collaborators.records.lock();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].final_state, "failed");
    }

    #[tokio::test]
    async fn post_update_test_failure_rolls_back_everything() {
        let journal = Journal::new();
        let collaborators = Arc::new(ScriptedCollaborators {
            failing_post_update: true,
            ..ScriptedCollaborators::default()
        });
        let orchestrator = with_collaborators(three(&journal), collaborators.clone());
        let options = UpdateOptions {
            run_tests: true,
            ..UpdateOptions::default()
        };

        let failure = failure(orchestrator.update(&options).await.unwrap_err());
        assert!(matches!(failure.error, UpdateError::TestFailure(_)));
        assert_eq!(failure.phase, PipelineState::Verify);
        assert_eq!(
            journal.participants_for(LifecyclePhase::Rollback),
            vec!["container", "source_sync", "snapshot"]
        );
        let rollback = failure.rollback.as_ref().unwrap();
        assert!(rollback.tests.as_ref().unwrap().success);
        assert!(rollback.is_clean());
        assert_eq!(collaborators.records.lock()[0].final_state, "rolled_back");
    }

    #[test]
    fn failure_display_names_phase_and_participant() {
        let failure = PipelineFailure {
            run_id: "run".into(),
            error: UpdateError::Verification("container exited".into()),
            phase: PipelineState::Apply(2),
            participant: Some("container".into()),
            outcomes: Vec::new(),
            rollback: None,
            monitoring: MonitorReport::default(),
        };
        assert_eq!(
            failure.to_string(),
            "update failed during apply[2] (container): verification failed: container exited"
        );
    }
}
