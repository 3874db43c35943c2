//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant contract and pipeline data model."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the container participant, targeted by `skip_container_redeploy`.
pub const CONTAINER_PARTICIPANT: &str = "container";

/// Immutable configuration for one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    /// Target branch; `None` selects the configured main line.
    #[serde(default)]
    pub branch: Option<String>,
    /// Proceed even when no participant reports an update.
    #[serde(default)]
    pub force: bool,
    /// Skip the whole backup phase.
    #[serde(default)]
    pub skip_backup: bool,
    /// Leave the container participant out of the run.
    #[serde(default)]
    pub skip_container_redeploy: bool,
    /// Additional participants left out of the run, by name.
    #[serde(default)]
    pub skip_participants: BTreeSet<String>,
    /// Run the regression suites around the apply phase.
    #[serde(default)]
    pub run_tests: bool,
}

impl UpdateOptions {
    /// Whether the named participant is disabled for this run.
    pub fn skips(&self, participant: &str) -> bool {
        (self.skip_container_redeploy && participant == CONTAINER_PARTICIPANT)
            || self.skip_participants.contains(participant)
    }

    /// Requested branch, falling back to `default_branch`.
    pub fn branch_or<'a>(&'a self, default_branch: &'a str) -> &'a str {
        self.branch.as_deref().unwrap_or(default_branch)
    }
}

/// Outcome of a read-only update check for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub has_update: bool,
    /// One-line human readable summary.
    pub summary: String,
    pub detail: UpdateDetail,
}

impl UpdateInfo {
    pub fn new(has_update: bool, summary: impl Into<String>, detail: UpdateDetail) -> Self {
        Self {
            has_update,
            summary: summary.into(),
            detail,
        }
    }
}

/// Participant specific check detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateDetail {
    SourceSync(SourceSyncInfo),
    Container(ContainerInfo),
    Snapshot(SnapshotInfo),
    None,
}

/// Comparison between the local head and the remote branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSyncInfo {
    pub branch: String,
    pub local_head: String,
    pub remote_head: String,
    /// Commits on the remote branch missing locally.
    pub update_count: u32,
    /// Pending commits, oldest first.
    pub pending_commits: Vec<CommitInfo>,
    pub diff: DiffStat,
}

/// Commit metadata as reported by version control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub subject: String,
    pub author: String,
    pub date: String,
    #[serde(default)]
    pub body: String,
}

/// Aggregate size of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Container runtime state observed by the check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub runtime_version: String,
    pub container_name: String,
    pub image_tag: String,
    pub container_exists: bool,
    pub container_running: bool,
    pub image_exists: bool,
}

/// Space estimate for a full-tree backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub required_bytes: u64,
    pub available_bytes: u64,
    pub headroom_factor: f64,
    pub sufficient: bool,
}

/// Outcome of one participant's `update()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    pub summary: String,
    pub changes: ChangeSet,
    #[serde(default)]
    pub error: Option<String>,
}

impl UpdateResult {
    /// Successful result carrying the given change set.
    pub fn applied(summary: impl Into<String>, changes: ChangeSet) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            changes,
            error: None,
        }
    }

    /// Successful result that changed nothing.
    pub fn noop(summary: impl Into<String>) -> Self {
        Self::applied(summary, ChangeSet::None)
    }

    /// Unsuccessful result with failure detail.
    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            changes: ChangeSet::None,
            error: Some(error.into()),
        }
    }
}

/// Participant specific description of what an update changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeSet {
    SourceSync {
        previous_head: String,
        new_head: String,
        commit: Option<CommitInfo>,
        files: Vec<FileChange>,
    },
    Container {
        container_name: String,
        image_tag: String,
        strategy: BuildStrategy,
        container_id: String,
    },
    Snapshot {
        backup_dir: PathBuf,
        files_copied: u64,
        bytes_copied: u64,
    },
    None,
}

/// A single path touched by a source update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: String,
    /// Original path for renames.
    #[serde(default)]
    pub previous_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// How the container image was rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStrategy {
    Compose,
    DirectBuild,
}

/// Sortable UTC timestamp suffix used for backup refs, directories, and log files.
pub fn timestamp_suffix(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn container_skip_flag_targets_container_participant() {
        let options = UpdateOptions {
            skip_container_redeploy: true,
            ..UpdateOptions::default()
        };
        assert!(options.skips(CONTAINER_PARTICIPANT));
        assert!(!options.skips("source_sync"));

        let mut explicit = UpdateOptions::default();
        explicit.skip_participants.insert("snapshot".into());
        assert!(explicit.skips("snapshot"));
        assert!(!explicit.skips(CONTAINER_PARTICIPANT));
    }

    #[test]
    fn branch_falls_back_to_default() {
        let options = UpdateOptions::default();
        assert_eq!(options.branch_or("main"), "main");
        let options = UpdateOptions {
            branch: Some("release".into()),
            ..UpdateOptions::default()
        };
        assert_eq!(options.branch_or("main"), "release");
    }

    #[test]
    fn timestamp_suffix_sorts_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let a = timestamp_suffix(earlier);
        let b = timestamp_suffix(later);
        assert_eq!(a, "20260109T235959000Z");
        assert!(a < b);
    }

    #[test]
    fn change_set_serializes_with_kind_tag() {
        let changes = ChangeSet::Snapshot {
            backup_dir: PathBuf::from("/backups/backup-1"),
            files_copied: 3,
            bytes_copied: 42,
        };
        let value = serde_json::to_value(&changes).unwrap();
        assert_eq!(value["kind"], "snapshot");
        assert_eq!(value["files_copied"], 3);
    }
}
