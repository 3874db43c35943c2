//! ---
//! phx_section: "15-testing-qa-runbook"
//! phx_subsection: "harness"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Test doubles for the process runner and participants."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use phx_core::{
    Result, UpdateDetail, UpdateError, UpdateInfo, UpdateOptions, UpdateParticipant, UpdateResult,
};

/// Lifecycle method of the participant contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Check,
    PreCheck,
    Backup,
    Update,
    Rollback,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecyclePhase::Check => "check",
            LifecyclePhase::PreCheck => "precheck",
            LifecyclePhase::Backup => "backup",
            LifecyclePhase::Update => "update",
            LifecyclePhase::Rollback => "rollback",
        };
        f.write_str(label)
    }
}

/// Ordered record of participant calls shared across participants.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<(String, LifecyclePhase)>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, participant: &str, phase: LifecyclePhase) {
        self.entries.lock().push((participant.to_owned(), phase));
    }

    /// Every call as `participant:phase`.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(name, phase)| format!("{name}:{phase}"))
            .collect()
    }

    /// Participants that received `phase`, in call order.
    pub fn participants_for(&self, phase: LifecyclePhase) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, recorded)| *recorded == phase)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Participant that records every call and fails on demand.
#[derive(Debug)]
pub struct RecordingParticipant {
    name: String,
    journal: Journal,
    has_update: bool,
    fail_on: Option<LifecyclePhase>,
    /// Report failure through `UpdateResult::success = false` instead of an error.
    soft_failure: bool,
    update_delay: Option<Duration>,
}

impl RecordingParticipant {
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            has_update: true,
            fail_on: None,
            soft_failure: false,
            update_delay: None,
        }
    }

    pub fn without_update(mut self) -> Self {
        self.has_update = false;
        self
    }

    pub fn failing_on(mut self, phase: LifecyclePhase) -> Self {
        self.fail_on = Some(phase);
        self
    }

    pub fn with_soft_failure(mut self) -> Self {
        self.soft_failure = true;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = Some(delay);
        self
    }

    fn enter(&self, phase: LifecyclePhase) -> Result<()> {
        self.journal.push(&self.name, phase);
        if self.fail_on == Some(phase) {
            let message = format!("{} failed during {phase}", self.name);
            return Err(match phase {
                LifecyclePhase::PreCheck => UpdateError::State(message),
                LifecyclePhase::Update => UpdateError::Verification(message),
                _ => UpdateError::execution(format!("{}-{phase}", self.name), message),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateParticipant for RecordingParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_for_updates(&self, _options: &UpdateOptions) -> Result<UpdateInfo> {
        self.enter(LifecyclePhase::Check)?;
        Ok(UpdateInfo::new(
            self.has_update,
            format!("{} has_update={}", self.name, self.has_update),
            UpdateDetail::None,
        ))
    }

    async fn pre_update_check(&self, _options: &UpdateOptions) -> Result<()> {
        self.enter(LifecyclePhase::PreCheck)
    }

    async fn backup(&self) -> Result<()> {
        self.enter(LifecyclePhase::Backup)
    }

    async fn update(&self, _options: &UpdateOptions) -> Result<UpdateResult> {
        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }
        if self.soft_failure && self.fail_on == Some(LifecyclePhase::Update) {
            self.journal.push(&self.name, LifecyclePhase::Update);
            return Ok(UpdateResult::failed(
                format!("{} update incomplete", self.name),
                "soft failure",
            ));
        }
        self.enter(LifecyclePhase::Update)?;
        Ok(UpdateResult::noop(format!("{} updated", self.name)))
    }

    async fn rollback(&self) -> Result<()> {
        self.enter(LifecyclePhase::Rollback)
    }
}
