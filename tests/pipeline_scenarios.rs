//! ---
//! phx_section: "15-testing-qa-runbook"
//! phx_subsection: "integration-tests"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "End to end pipeline scenarios over the reference participants."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use phx_common::{ContainerConfig, SnapshotConfig, SourceConfig};
use phx_core::{
    BuildStrategy, ChangeKind, ChangeSet, ErrorKind, ParticipantHandle, RunOperation,
    UpdateDetail, UpdateOptions,
};
use phx_monitor::{new_registry, PipelineMetrics};
use phx_orchestrator::{
    ParticipantRegistry, PipelineError, PipelineFailure, PipelineState, UpdateOrchestrator,
};
use phx_participants::{
    ContainerParticipant, SnapshotParticipant, SourceSyncParticipant, DiskSpace,
};
use phx_persistence::RunLedger;
use phx_process::{ProcessOutput, ProcessRequest, ProcessRunner};
use phx_testharness::{Scripted, ScriptedRunner};
use tempfile::TempDir;

const INSPECT_STATE: &str =
    "docker inspect --type container --format={{.State.Running}} phoenix-bot";
const INSPECT_ID: &str = "docker inspect --type container --format={{.Id}} phoenix-bot";
const BACKUP_REF: &str = "phoenix-backup-20261019T120000000Z";
const COMMITTED: &str = "{\"version\":1}\n";
const LOCAL_EDIT: &str = "{\"version\":1,\"debug\":true}\n";

#[derive(Debug)]
struct FixedSpace(u64);

impl DiskSpace for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// Mirrors resets and stashes of `config.json` on disk, so restores are
/// observable in the working tree.
#[derive(Debug)]
struct CheckoutRunner {
    script: Arc<ScriptedRunner>,
    worktree: PathBuf,
    stash: Mutex<Vec<String>>,
}

impl CheckoutRunner {
    fn write_config(&self, contents: &str) {
        fs::write(self.worktree.join("config.json"), contents).expect("simulate checkout");
    }
}

#[async_trait]
impl ProcessRunner for CheckoutRunner {
    async fn run(&self, request: &ProcessRequest) -> phx_process::Result<ProcessOutput> {
        let output = self.script.run(request).await?;
        if !output.success() {
            return Ok(output);
        }
        let line = request.command_line();
        if line == "git reset --hard origin/main" {
            self.write_config("{\"version\":2}\n");
        } else if line.starts_with("git reset --hard phoenix-backup-") {
            self.write_config(COMMITTED);
        } else if line.starts_with("git stash push") {
            let edit = fs::read_to_string(self.worktree.join("config.json")).expect("read edit");
            self.stash.lock().unwrap().push(edit);
            self.write_config(COMMITTED);
        } else if line == "git stash pop" {
            if let Some(edit) = self.stash.lock().unwrap().pop() {
                self.write_config(&edit);
            }
        }
        Ok(output)
    }
}

fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput::ok(stdout)
}

fn commit_record(hash: &str, subject: &str) -> String {
    format!("{hash}\u{1f}{subject}\u{1f}Dev\u{1f}2026-10-18T09:00:00+00:00\u{1f}\n\u{1e}\n")
}

/// `main` is three commits ahead of the local `aaa` head.
fn script_git_behind(script: &ScriptedRunner) {
    let pending = format!(
        "{}{}{}",
        commit_record("bbb", "first"),
        commit_record("ccc", "second"),
        commit_record("ddd", "third")
    );
    script.on("git fetch origin main", ok(""));
    script.on_sequence("git rev-parse HEAD", vec![ok("aaa\n").into(), ok("ddd\n").into()]);
    script.on("git rev-parse origin/main", ok("ddd\n"));
    script.on("git rev-list --count HEAD..origin/main", ok("3\n"));
    script.on("git log --reverse", ok(&pending));
    script.on(
        "git diff --shortstat HEAD origin/main",
        ok(" 2 files changed, 5 insertions(+)\n"),
    );
    script.on("git --version", ok("git version 2.45.0\n"));
    script.on("git rev-parse --is-inside-work-tree", ok("true\n"));
    script.on("git ls-remote --heads origin main", ok("ddd\trefs/heads/main\n"));
    script.on("git status --porcelain", ok(""));
    script.on("git rev-list --count origin/main..HEAD", ok("0\n"));
    script.on("git rev-parse --verify HEAD", ok("aaa\n"));
    script.on("git branch phoenix-backup-", ok(""));
    script.on("git reset --hard", ok("HEAD is now at ddd\n"));
    script.on("git log -1", ok(&commit_record("ddd", "third")));
    script.on(
        "git diff --name-status -M aaa ddd",
        ok("M\tconfig.json\nA\tscripts/run.sh\n"),
    );
    script.on("git for-each-ref", ok(&format!("{BACKUP_REF}\n")));
}

/// No container or image exists yet; the direct build brings one up.
fn script_docker_cold_start(script: &ScriptedRunner) {
    script.on("docker --version", ok("Docker version 27.0.1\n"));
    script.on("docker image inspect", ProcessOutput::failed(1, "No such image"));
    let missing = || ProcessOutput::failed(1, "No such container").into();
    // check, backup and the pre-deploy inspect see nothing; verification sees it running.
    script.on_sequence(
        INSPECT_STATE,
        vec![missing(), missing(), missing(), ok("true\n").into()],
    );
    script.on("docker build -t phoenix-bot:latest", ok(""));
    script.on("docker run -d --name phoenix-bot", ok("abc123def456\n"));
    script.on(INSPECT_ID, ok("abc123def456\n"));
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    script: Arc<ScriptedRunner>,
    ledger: Arc<RunLedger>,
    metrics: PipelineMetrics,
    orchestrator: UpdateOrchestrator,
}

impl Fixture {
    fn new(available_space: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let app = root.join("app");
        fs::create_dir_all(app.join("src")).unwrap();
        fs::write(app.join("config.json"), COMMITTED).unwrap();
        fs::write(app.join("src/bot.py"), "print('hi')\n").unwrap();

        let script = Arc::new(ScriptedRunner::new());
        let runner: Arc<dyn ProcessRunner> = Arc::new(CheckoutRunner {
            script: script.clone(),
            worktree: app.clone(),
            stash: Mutex::new(Vec::new()),
        });
        let timeout = Duration::from_secs(5);
        let handles: Vec<ParticipantHandle> = vec![
            Arc::new(SnapshotParticipant::with_disk_space(
                SnapshotConfig {
                    source_root: app.clone(),
                    backup_root: root.join("backups"),
                    ..SnapshotConfig::default()
                },
                Arc::new(FixedSpace(available_space)),
            )),
            Arc::new(SourceSyncParticipant::new(
                SourceConfig {
                    repo_path: app.clone(),
                    ..SourceConfig::default()
                },
                runner.clone(),
                timeout,
            )),
            Arc::new(ContainerParticipant::new(
                ContainerConfig {
                    build_context: app.clone(),
                    logs_dir: root.join("logs"),
                    ..ContainerConfig::default()
                },
                runner,
                timeout,
            )),
        ];
        let ledger = Arc::new(RunLedger::open(root.join("ledger")).unwrap());
        let metrics = PipelineMetrics::new(new_registry()).unwrap();
        let orchestrator = UpdateOrchestrator::new(ParticipantRegistry::new(handles).unwrap())
            .with_store(ledger.clone())
            .with_metrics(metrics.clone());
        Self {
            _dir: dir,
            root,
            script,
            ledger,
            metrics,
            orchestrator,
        }
    }

    fn app_file(&self, name: &str) -> String {
        fs::read_to_string(self.root.join("app").join(name)).unwrap()
    }

    fn snapshot_dirs(&self) -> usize {
        fs::read_dir(self.root.join("backups"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn expect_failure(result: Result<phx_orchestrator::PipelineReport, PipelineError>) -> Box<PipelineFailure> {
    match result {
        Err(PipelineError::Failed(failure)) => failure,
        Err(PipelineError::Busy) => panic!("unexpected busy"),
        Ok(report) => panic!("expected failure, got {report:?}"),
    }
}

#[tokio::test]
async fn check_reports_pending_commits_without_mutating() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);

    let summary = fixture
        .orchestrator
        .check_for_updates(&UpdateOptions::default())
        .await;
    assert!(summary.errors().is_empty());
    assert_eq!(summary.pending(), vec!["source_sync", "container"]);
    let source = summary
        .participants
        .iter()
        .find(|check| check.participant == "source_sync")
        .and_then(|check| check.info.as_ref())
        .unwrap();
    let UpdateDetail::SourceSync(detail) = &source.detail else {
        panic!("unexpected detail");
    };
    assert_eq!(detail.update_count, 3);
    let hashes: Vec<&str> = detail.pending_commits.iter().map(|c| c.hash.as_str()).collect();
    assert_eq!(hashes, vec!["bbb", "ccc", "ddd"]);
    assert_eq!(detail.diff.files_changed, 2);

    for mutating in ["git reset", "git branch", "git stash", "docker build", "docker run", "docker rm"] {
        assert!(!fixture.script.was_called(mutating), "{mutating} ran during check");
    }
    assert_eq!(fixture.snapshot_dirs(), 0);
    assert!(fixture.ledger.history(10).unwrap().is_empty());
}

#[tokio::test]
async fn full_update_syncs_sources_and_cold_starts_the_container() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);

    let report = fixture
        .orchestrator
        .update(&UpdateOptions::default())
        .await
        .unwrap();
    assert!(report.updated);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes.iter().all(|outcome| outcome.result.success));

    let ChangeSet::SourceSync { new_head, files, .. } = &report.outcomes[1].result.changes else {
        panic!("unexpected source change set");
    };
    assert_eq!(new_head, "ddd");
    assert_eq!(files[0].kind, ChangeKind::Modified);
    assert_eq!(files[1].path, "scripts/run.sh");

    let ChangeSet::Container {
        strategy,
        container_id,
        ..
    } = &report.outcomes[2].result.changes
    else {
        panic!("unexpected container change set");
    };
    assert_eq!(*strategy, BuildStrategy::DirectBuild);
    assert_eq!(container_id, "abc123def456");
    assert!(!fixture.script.was_called("docker stop"));
    assert!(fixture.script.was_called("git branch phoenix-backup-"));
    assert_eq!(fixture.app_file("config.json"), "{\"version\":2}\n");
    // The snapshot participant's apply reuses the backup phase copy.
    assert_eq!(fixture.snapshot_dirs(), 1);

    assert_eq!(fixture.orchestrator.state(), PipelineState::Done);
    assert_eq!(fixture.metrics.runs("update", "updated"), 1);
    let history = fixture.ledger.history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success && history[0].updated);
    assert_eq!(history[0].participants.len(), 3);
}

#[tokio::test]
async fn container_failure_rolls_back_sources_then_snapshot() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);
    fixture.script.on(
        "docker build -t phoenix-bot:latest",
        ProcessOutput::failed(1, "failed to solve: missing requirements.txt"),
    );

    let failure = expect_failure(fixture.orchestrator.update(&UpdateOptions::default()).await);
    assert_eq!(failure.error.kind(), ErrorKind::Execution);
    assert_eq!(failure.phase, PipelineState::Apply(2));
    assert_eq!(failure.participant.as_deref(), Some("container"));

    let rollback = failure.rollback.as_ref().unwrap();
    assert_eq!(rollback.attempted, vec!["source_sync", "snapshot"]);
    assert!(rollback.is_clean());
    assert_eq!(failure.final_state(), PipelineState::RolledBack);

    // The branch created by this run wins over older ones listed by name.
    assert!(fixture.script.was_called("git reset --hard phoenix-backup-"));
    assert!(!fixture
        .script
        .was_called(&format!("git reset --hard {BACKUP_REF}")));
    assert!(!fixture.script.was_called("docker start"));
    assert!(!fixture.script.was_called("docker run"));
    assert_eq!(fixture.app_file("config.json"), COMMITTED);

    let history = fixture.ledger.history(10).unwrap();
    assert_eq!(history[0].final_state, "rolled_back");
    assert!(history[0].error.as_deref().unwrap().contains("docker build"));
    assert_eq!(fixture.metrics.runs("update", "rolled_back"), 1);

    // A requested rollback afterwards reports per-participant results instead of erroring.
    for _ in 0..2 {
        let summary = fixture
            .orchestrator
            .rollback(&UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.attempted, vec!["container", "source_sync", "snapshot"]);
    }
    let history = fixture.ledger.history(10).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].operation, RunOperation::Rollback);
}

#[tokio::test]
async fn local_edits_survive_a_failed_update() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);
    fs::write(fixture.root.join("app/config.json"), LOCAL_EDIT).unwrap();
    fixture.script.on("git status --porcelain", ok(" M config.json\n"));
    fixture.script.on("git stash push", ok("Saved working directory\n"));
    fixture.script.on("git stash pop", ok(""));
    fixture.script.on(
        "docker build -t phoenix-bot:latest",
        ProcessOutput::failed(1, "failed to solve"),
    );

    let failure = expect_failure(fixture.orchestrator.update(&UpdateOptions::default()).await);
    assert_eq!(failure.phase, PipelineState::Apply(2));
    assert!(failure.rollback.as_ref().unwrap().is_clean());
    assert_eq!(failure.final_state(), PipelineState::RolledBack);

    assert_eq!(fixture.script.count("git stash pop"), 1);
    assert_eq!(fixture.snapshot_dirs(), 1);
    assert_eq!(fixture.app_file("config.json"), LOCAL_EDIT);
}

#[tokio::test]
async fn stalled_build_times_out_and_rolls_back() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);
    fixture
        .script
        .on("docker build -t phoenix-bot:latest", Scripted::Timeout);

    let failure = expect_failure(fixture.orchestrator.update(&UpdateOptions::default()).await);
    assert_eq!(failure.error.kind(), ErrorKind::Execution);
    assert!(failure.error.to_string().contains("timed out"));
    assert_eq!(failure.phase, PipelineState::Apply(2));
    assert_eq!(failure.participant.as_deref(), Some("container"));

    let rollback = failure.rollback.as_ref().unwrap();
    assert_eq!(rollback.attempted, vec!["source_sync", "snapshot"]);
    assert_eq!(failure.final_state(), PipelineState::RolledBack);
    assert!(!fixture.script.was_called("docker run"));
    assert_eq!(fixture.app_file("config.json"), COMMITTED);
    assert_eq!(fixture.ledger.history(1).unwrap()[0].final_state, "rolled_back");
}

#[tokio::test]
async fn insufficient_space_is_advisory() {
    let fixture = Fixture::new(1);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);

    let summary = fixture
        .orchestrator
        .check_for_updates(&UpdateOptions::default())
        .await;
    let snapshot = summary.participants[0].info.as_ref().unwrap();
    assert!(!snapshot.has_update);
    let UpdateDetail::Snapshot(detail) = &snapshot.detail else {
        panic!("unexpected detail");
    };
    assert!(!detail.sufficient);

    let report = fixture
        .orchestrator
        .update(&UpdateOptions::default())
        .await
        .unwrap();
    assert!(report.updated);
    assert_eq!(report.outcomes[0].result.changes, ChangeSet::None);
    assert!(report.outcomes[2].result.success);
}

#[tokio::test]
async fn missing_git_aborts_before_any_backup() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    script_docker_cold_start(&fixture.script);
    fixture.script.on("git --version", Scripted::SpawnError);

    let failure = expect_failure(fixture.orchestrator.update(&UpdateOptions::default())
        .await);
    assert_eq!(failure.error.kind(), ErrorKind::Validation);
    assert_eq!(failure.phase, PipelineState::Precheck);
    assert!(failure.rollback.is_none());
    assert_eq!(fixture.snapshot_dirs(), 0);
    assert!(!fixture.script.was_called("git branch"));
    assert!(!fixture.script.was_called("docker build"));
    assert_eq!(fixture.metrics.runs("update", "failed"), 1);
}

#[tokio::test]
async fn skipping_the_container_leaves_the_runtime_untouched() {
    let fixture = Fixture::new(1 << 30);
    script_git_behind(&fixture.script);
    let options = UpdateOptions {
        skip_container_redeploy: true,
        ..UpdateOptions::default()
    };

    let report = fixture.orchestrator.update(&options).await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(!fixture.script.was_called("docker"));
}
