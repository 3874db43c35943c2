//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant contract and pipeline data model."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Narrow interfaces to the collaborators the orchestrator consults around
//! the participant lifecycle: regression tests, resource telemetry, and the
//! persistent store.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of a regression suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    pub summary: String,
}

impl TestReport {
    pub fn passed(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

/// Regression suites run around the apply phase.
#[async_trait]
pub trait TestRunner: Send + Sync + fmt::Debug {
    async fn run_pre_update_tests(&self) -> Result<TestReport>;
    async fn run_post_update_tests(&self) -> Result<TestReport>;
    async fn run_post_rollback_tests(&self) -> Result<TestReport>;
}

/// Whether the host can afford an update right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub sufficient: bool,
    pub detail: String,
}

/// Telemetry gathered while a monitoring session was active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub label: String,
    pub duration_ms: u64,
    pub samples: u64,
    pub peak_memory_bytes: u64,
}

impl MonitorReport {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// A running monitoring session.
pub trait MonitorSession: Send + fmt::Debug {
    /// Stop sampling. Further calls are no-ops.
    fn stop(&mut self);

    /// Telemetry gathered so far.
    fn results(&self) -> MonitorReport;
}

/// Resource telemetry wrapped around update and rollback runs.
#[async_trait]
pub trait ResourceMonitor: Send + Sync + fmt::Debug {
    async fn check_system_resources(&self) -> Result<ResourceStatus>;
    fn start_update_monitoring(&self) -> Box<dyn MonitorSession>;
    fn start_rollback_monitoring(&self) -> Box<dyn MonitorSession>;
}

/// Health of the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub healthy: bool,
    pub detail: String,
}

/// Result of re-verifying every stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub records_checked: usize,
    pub corrupted: Vec<String>,
}

/// Kind of pipeline operation recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    Update,
    Rollback,
}

impl fmt::Display for RunOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOperation::Update => "update",
            RunOperation::Rollback => "rollback",
        })
    }
}

/// Per-participant line of a [`RunRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Durable summary of one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub operation: RunOperation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub updated: bool,
    /// Final pipeline state label.
    pub final_state: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub participants: Vec<ParticipantRecord>,
    #[serde(default)]
    pub version: String,
}

/// Persistent store consulted before and after mutations.
#[async_trait]
pub trait PersistentStore: Send + Sync + fmt::Debug {
    async fn check_status(&self) -> Result<StoreStatus>;
    /// Back up the store itself, returning the artifact path when one was written.
    async fn create_backup(&self) -> Result<Option<PathBuf>>;
    async fn verify_integrity(&self) -> Result<IntegrityReport>;
    async fn record_run(&self, record: &RunRecord) -> Result<()>;
}

/// Test runner that always passes without running anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTestRunner;

#[async_trait]
impl TestRunner for NoopTestRunner {
    async fn run_pre_update_tests(&self) -> Result<TestReport> {
        Ok(TestReport::passed("no pre-update suite configured"))
    }

    async fn run_post_update_tests(&self) -> Result<TestReport> {
        Ok(TestReport::passed("no post-update suite configured"))
    }

    async fn run_post_rollback_tests(&self) -> Result<TestReport> {
        Ok(TestReport::passed("no post-rollback suite configured"))
    }
}

/// Monitor that always reports sufficient resources and records only wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

#[derive(Debug)]
struct WallClockSession {
    label: &'static str,
    started: std::time::Instant,
    elapsed: Option<Duration>,
}

impl MonitorSession for WallClockSession {
    fn stop(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(self.started.elapsed());
        }
    }

    fn results(&self) -> MonitorReport {
        let elapsed = self.elapsed.unwrap_or_else(|| self.started.elapsed());
        MonitorReport {
            label: self.label.to_owned(),
            duration_ms: elapsed.as_millis() as u64,
            samples: 0,
            peak_memory_bytes: 0,
        }
    }
}

#[async_trait]
impl ResourceMonitor for NoopMonitor {
    async fn check_system_resources(&self) -> Result<ResourceStatus> {
        Ok(ResourceStatus {
            sufficient: true,
            detail: "resource checks disabled".to_owned(),
        })
    }

    fn start_update_monitoring(&self) -> Box<dyn MonitorSession> {
        Box::new(WallClockSession {
            label: "update",
            started: std::time::Instant::now(),
            elapsed: None,
        })
    }

    fn start_rollback_monitoring(&self) -> Box<dyn MonitorSession> {
        Box::new(WallClockSession {
            label: "rollback",
            started: std::time::Instant::now(),
            elapsed: None,
        })
    }
}

/// Store that is always healthy and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl PersistentStore for NoopStore {
    async fn check_status(&self) -> Result<StoreStatus> {
        Ok(StoreStatus {
            healthy: true,
            detail: "no persistent store configured".to_owned(),
        })
    }

    async fn create_backup(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    async fn verify_integrity(&self) -> Result<IntegrityReport> {
        Ok(IntegrityReport {
            ok: true,
            records_checked: 0,
            corrupted: Vec::new(),
        })
    }

    async fn record_run(&self, _record: &RunRecord) -> Result<()> {
        Ok(())
    }
}
