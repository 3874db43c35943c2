//! ---
//! phx_section: "06-update-participants"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Version-control sync participant."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Pulls the target branch from the configured remote and hard-resets the
//! working copy onto it. Backups are `phoenix-backup-<timestamp>` branches
//! plus an optional stash of uncommitted work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use phx_common::SourceConfig;
use phx_core::{
    timestamp_suffix, ChangeKind, ChangeSet, CommitInfo, DiffStat, FileChange, Result,
    SourceSyncInfo, UpdateDetail, UpdateError, UpdateInfo, UpdateOptions, UpdateParticipant,
    UpdateResult,
};
use phx_logging::ScopedLogger;
use phx_process::{run_checked, ProcessOutput, ProcessRequest, ProcessRunner};
use tracing::debug;

/// Prefix of the backup branches created before every update.
pub const BACKUP_REF_PREFIX: &str = "phoenix-backup-";

const PARTICIPANT_NAME: &str = "source_sync";

/// Unit separator between fields, record separator between commits.
const LOG_FORMAT: &str = "--format=%H%x1f%s%x1f%an%x1f%aI%x1f%b%x1e";

#[derive(Debug, Default)]
struct SyncState {
    /// Started by precheck; `None` until this process runs an update.
    run: Option<RunBackup>,
    changed_files: Vec<FileChange>,
}

#[derive(Debug, Default)]
struct RunBackup {
    stashed: bool,
    backup_ref: Option<String>,
}

/// Version-control sync participant backed by the `git` CLI.
#[derive(Debug)]
pub struct SourceSyncParticipant {
    config: SourceConfig,
    runner: Arc<dyn ProcessRunner>,
    command_timeout: Duration,
    logger: ScopedLogger,
    state: Mutex<SyncState>,
}

impl SourceSyncParticipant {
    pub fn new(
        config: SourceConfig,
        runner: Arc<dyn ProcessRunner>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            config,
            runner,
            command_timeout,
            logger: ScopedLogger::new(PARTICIPANT_NAME),
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Paths touched by the most recent `update()`.
    pub fn changed_files(&self) -> Vec<FileChange> {
        self.state.lock().changed_files.clone()
    }

    /// Backup branch created by the most recent `backup()`.
    pub fn last_backup_ref(&self) -> Option<String> {
        self.state
            .lock()
            .run
            .as_ref()
            .and_then(|run| run.backup_ref.clone())
    }

    fn git<I, S>(&self, args: I) -> ProcessRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessRequest::new(&self.config.git_binary)
            .args(args)
            .current_dir(&self.config.repo_path)
            .timeout(self.command_timeout)
    }

    async fn git_unchecked(&self, args: &[&str]) -> Result<ProcessOutput> {
        Ok(self.runner.run(&self.git(args.iter().copied())).await?)
    }

    async fn git_stdout(&self, args: &[&str]) -> Result<String> {
        let output = run_checked(self.runner.as_ref(), &self.git(args.iter().copied())).await?;
        Ok(output.stdout_trimmed().to_owned())
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("{}/{}", self.config.remote_name, branch)
    }

    async fn fetch(&self, branch: &str) -> Result<()> {
        self.git_stdout(&["fetch", &self.config.remote_name, branch])
            .await
            .map(|_| ())
    }

    async fn head(&self) -> Result<Option<String>> {
        let output = self.git_unchecked(&["rev-parse", "--verify", "HEAD"]).await?;
        Ok(output
            .success()
            .then(|| output.stdout_trimmed().to_owned()))
    }

    async fn branch_exists_on_remote(&self, branch: &str) -> Result<bool> {
        let stdout = self
            .git_stdout(&["ls-remote", "--heads", &self.config.remote_name, branch])
            .await?;
        Ok(!stdout.is_empty())
    }

    async fn is_dirty(&self) -> Result<bool> {
        let stdout = self.git_stdout(&["status", "--porcelain"]).await?;
        Ok(!stdout.is_empty())
    }

    async fn unpushed_commits(&self, branch: &str) -> Result<u32> {
        let range = format!("{}..HEAD", self.remote_ref(branch));
        let output = self.git_unchecked(&["rev-list", "--count", &range]).await?;
        Ok(if output.success() {
            output.stdout_trimmed().parse().unwrap_or(0)
        } else {
            0
        })
    }

    /// Newest backup branch by name, for rollbacks outside an update run.
    async fn latest_backup_ref(&self) -> Result<String> {
        let pattern = format!("refs/heads/{BACKUP_REF_PREFIX}*");
        let refs = self
            .git_stdout(&["for-each-ref", "--format=%(refname:short)", &pattern])
            .await?;
        latest_ref(&refs)
            .ok_or_else(|| UpdateError::State("no backup branch to roll back to".to_owned()))
    }

    async fn ensure_repository(&self) -> Result<()> {
        let inside = self
            .git_unchecked(&["rev-parse", "--is-inside-work-tree"])
            .await?;
        if inside.success() && inside.stdout_trimmed() == "true" {
            return Ok(());
        }
        let Some(url) = self.config.remote_url.as_deref() else {
            return Err(UpdateError::State(format!(
                "{} is not a git working copy and no remote_url is configured",
                self.config.repo_path.display()
            )));
        };
        self.logger.warn(format!(
            "{} is not a repository; initialising and attaching {}",
            self.config.repo_path.display(),
            url
        ));
        tokio::fs::create_dir_all(&self.config.repo_path).await?;
        self.git_stdout(&["init"]).await?;
        self.git_stdout(&["remote", "add", &self.config.remote_name, url])
            .await?;
        Ok(())
    }

    async fn ensure_remote_url(&self) -> Result<()> {
        let Some(expected) = self.config.remote_url.as_deref() else {
            return Ok(());
        };
        let remote = self.config.remote_name.as_str();
        let current = self.git_unchecked(&["remote", "get-url", remote]).await?;
        if !current.success() {
            self.logger
                .warn(format!("remote {remote} missing; adding {expected}"));
            self.git_stdout(&["remote", "add", remote, expected]).await?;
        } else if current.stdout_trimmed() != expected {
            self.logger.warn(format!(
                "remote {remote} points at {}; correcting to {expected}",
                current.stdout_trimmed()
            ));
            self.git_stdout(&["remote", "set-url", remote, expected])
                .await?;
        }
        Ok(())
    }

    async fn classify_changes(&self, previous: Option<&str>, new_head: &str) -> Result<Vec<FileChange>> {
        match previous {
            Some(old) if old == new_head => Ok(Vec::new()),
            Some(old) => {
                let stdout = self
                    .git_stdout(&["diff", "--name-status", "-M", old, new_head])
                    .await?;
                Ok(parse_name_status(&stdout))
            }
            None => {
                let stdout = self
                    .git_stdout(&["ls-tree", "-r", "--name-only", new_head])
                    .await?;
                Ok(stdout
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(|path| FileChange {
                        kind: ChangeKind::Added,
                        path: path.to_owned(),
                        previous_path: None,
                    })
                    .collect())
            }
        }
    }

    fn is_executable_name(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.config
                    .executable_extensions
                    .iter()
                    .any(|wanted| wanted.trim_start_matches('.') == ext)
            })
            .unwrap_or(false)
    }

    async fn normalize_permissions(&self, changes: &[FileChange]) -> usize {
        let mut normalized = 0;
        for change in changes {
            if change.kind == ChangeKind::Deleted || !self.is_executable_name(&change.path) {
                continue;
            }
            let path = self.config.repo_path.join(&change.path);
            match set_executable(&path).await {
                Ok(true) => normalized += 1,
                Ok(false) => {}
                Err(err) => self.logger.warn(format!(
                    "unable to set executable bit on {}: {err}",
                    path.display()
                )),
            }
        }
        normalized
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    if !tokio::fs::try_exists(path).await? {
        return Ok(false);
    }
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(true)
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<bool> {
    Ok(false)
}

#[async_trait]
impl UpdateParticipant for SourceSyncParticipant {
    fn name(&self) -> &str {
        PARTICIPANT_NAME
    }

    async fn check_for_updates(&self, options: &UpdateOptions) -> Result<UpdateInfo> {
        let branch = options.branch_or(&self.config.default_branch);
        self.fetch(branch).await?;
        let remote_ref = self.remote_ref(branch);
        let local_head = self.git_stdout(&["rev-parse", "HEAD"]).await?;
        let remote_head = self.git_stdout(&["rev-parse", &remote_ref]).await?;

        let mut info = SourceSyncInfo {
            branch: branch.to_owned(),
            local_head: local_head.clone(),
            remote_head: remote_head.clone(),
            ..SourceSyncInfo::default()
        };
        if local_head == remote_head {
            self.logger.info(format!("{branch} is up to date at {local_head}"));
            return Ok(UpdateInfo::new(
                false,
                format!("{branch} is up to date"),
                UpdateDetail::SourceSync(info),
            ));
        }

        let range = format!("HEAD..{remote_ref}");
        info.update_count = self
            .git_stdout(&["rev-list", "--count", &range])
            .await?
            .parse()
            .map_err(|err| UpdateError::execution("git rev-list --count", err))?;
        let log = self
            .git_stdout(&["log", "--reverse", LOG_FORMAT, &range])
            .await?;
        info.pending_commits = parse_commit_log(&log);
        let shortstat = self
            .git_stdout(&["diff", "--shortstat", "HEAD", &remote_ref])
            .await?;
        info.diff = parse_shortstat(&shortstat);

        let summary = format!(
            "{} commit(s) behind {remote_ref}, {} file(s) changed",
            info.update_count, info.diff.files_changed
        );
        self.logger.info(&summary);
        Ok(UpdateInfo::new(true, summary, UpdateDetail::SourceSync(info)))
    }

    async fn pre_update_check(&self, options: &UpdateOptions) -> Result<()> {
        self.state.lock().run = Some(RunBackup::default());
        let branch = options.branch_or(&self.config.default_branch);
        match self.runner.run(&self.git(["--version"])).await {
            Ok(output) if output.success() => {
                debug!(version = %output.stdout_trimmed(), "git available");
            }
            Ok(output) => {
                return Err(UpdateError::Validation(format!(
                    "{} --version failed: {}",
                    self.config.git_binary,
                    output.stderr.trim()
                )))
            }
            Err(err) => {
                return Err(UpdateError::Validation(format!(
                    "{} is not available: {err}",
                    self.config.git_binary
                )))
            }
        }

        self.ensure_repository().await?;
        self.ensure_remote_url().await?;

        if !self.branch_exists_on_remote(branch).await? {
            return Err(UpdateError::State(format!(
                "branch {branch} does not exist on remote {}",
                self.config.remote_name
            )));
        }

        if self.is_dirty().await? {
            self.logger
                .warn("working copy has uncommitted changes; they will be stashed");
        }
        let unpushed = self.unpushed_commits(branch).await?;
        if unpushed > 0 {
            self.logger.warn(format!(
                "{unpushed} local commit(s) not on {}; the backup branch keeps them",
                self.remote_ref(branch)
            ));
        }
        self.logger.success(format!("ready to sync {branch}"));
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        let stamp = timestamp_suffix(Utc::now());
        let stashed = if self.is_dirty().await? {
            let message = format!("{BACKUP_REF_PREFIX}{stamp}");
            self.git_stdout(&["stash", "push", "--include-untracked", "-m", &message])
                .await?;
            self.logger.info("stashed uncommitted changes");
            true
        } else {
            false
        };

        let backup_ref = if self.head().await?.is_some() {
            let name = format!("{BACKUP_REF_PREFIX}{stamp}");
            self.git_stdout(&["branch", &name]).await?;
            self.logger.success(format!("created backup branch {name}"));
            Some(name)
        } else {
            self.logger.info("repository has no commits yet; no backup branch needed");
            None
        };

        self.state.lock().run = Some(RunBackup {
            stashed,
            backup_ref,
        });
        Ok(())
    }

    async fn update(&self, options: &UpdateOptions) -> Result<UpdateResult> {
        self.state.lock().changed_files.clear();
        let branch = options.branch_or(&self.config.default_branch);
        if !self.branch_exists_on_remote(branch).await? {
            return Err(UpdateError::State(format!(
                "branch {branch} does not exist on remote {}; refusing to reset",
                self.config.remote_name
            )));
        }

        let previous_head = self.head().await?;
        self.fetch(branch).await?;
        let remote_ref = self.remote_ref(branch);
        self.git_stdout(&["reset", "--hard", &remote_ref]).await?;
        let new_head = self.git_stdout(&["rev-parse", "HEAD"]).await?;

        let commit = parse_commit_log(
            &self
                .git_stdout(&["log", "-1", LOG_FORMAT, "HEAD"])
                .await?,
        )
        .into_iter()
        .next();
        let files = self
            .classify_changes(previous_head.as_deref(), &new_head)
            .await?;
        let normalized = self.normalize_permissions(&files).await;

        let summary = match previous_head.as_deref() {
            Some(old) if old == new_head => format!("already at {new_head}"),
            Some(old) => format!(
                "{old} -> {new_head}, {} path(s) changed, {normalized} made executable",
                files.len()
            ),
            None => format!("initial checkout of {new_head}, {} path(s)", files.len()),
        };
        self.logger.success(&summary);
        self.state.lock().changed_files = files.clone();

        Ok(UpdateResult::applied(
            summary,
            ChangeSet::SourceSync {
                previous_head: previous_head.unwrap_or_default(),
                new_head,
                commit,
                files,
            },
        ))
    }

    async fn rollback(&self) -> Result<()> {
        let recorded = self
            .state
            .lock()
            .run
            .as_ref()
            .map(|run| run.backup_ref.clone());
        let target = match recorded {
            Some(recorded) => recorded,
            None => Some(self.latest_backup_ref().await?),
        };

        match target {
            // Resetting keeps HEAD on the tracked branch; checking the backup
            // branch out would let the next update's hard reset move it.
            Some(target) => {
                self.git_stdout(&["reset", "--hard", &target]).await?;
                self.logger.info(format!("restored working copy from {target}"));
            }
            None => self
                .logger
                .warn("this run created no backup branch; working copy left as is"),
        }

        let stashed = self
            .state
            .lock()
            .run
            .as_mut()
            .map_or(false, |run| std::mem::take(&mut run.stashed));
        if stashed {
            self.git_stdout(&["stash", "pop"]).await?;
            self.logger.info("restored stashed changes");
        }
        self.logger.success("source rollback complete");
        Ok(())
    }
}

fn latest_ref(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(BACKUP_REF_PREFIX))
        .max()
        .map(str::to_owned)
}

fn parse_commit_log(raw: &str) -> Vec<CommitInfo> {
    raw.split('\u{1e}')
        .map(|record| record.trim_matches(|c: char| c == '\n' || c == '\r'))
        .filter(|record| !record.trim().is_empty())
        .filter_map(|record| {
            let mut fields = record.splitn(5, '\u{1f}');
            Some(CommitInfo {
                hash: fields.next()?.trim().to_owned(),
                subject: fields.next()?.to_owned(),
                author: fields.next()?.to_owned(),
                date: fields.next()?.to_owned(),
                body: fields.next().unwrap_or_default().trim().to_owned(),
            })
        })
        .collect()
}

fn parse_shortstat(raw: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for part in raw.trim().split(',') {
        let part = part.trim();
        let Some((count, label)) = part.split_once(' ') else {
            continue;
        };
        let Ok(count) = count.parse::<u32>() else {
            continue;
        };
        if label.starts_with("file") {
            stat.files_changed = count;
        } else if label.starts_with("insertion") {
            stat.insertions = count;
        } else if label.starts_with("deletion") {
            stat.deletions = count;
        }
    }
    stat
}

fn parse_name_status(raw: &str) -> Vec<FileChange> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let status = fields.next()?.trim();
            let first = fields.next()?.to_owned();
            let second = fields.next().map(str::to_owned);
            let change = match status.chars().next()? {
                'A' => FileChange {
                    kind: ChangeKind::Added,
                    path: first,
                    previous_path: None,
                },
                'D' => FileChange {
                    kind: ChangeKind::Deleted,
                    path: first,
                    previous_path: None,
                },
                'R' => FileChange {
                    kind: ChangeKind::Renamed,
                    path: second?,
                    previous_path: Some(first),
                },
                // Copies leave the source untouched; the destination is new.
                'C' => FileChange {
                    kind: ChangeKind::Added,
                    path: second?,
                    previous_path: None,
                },
                _ => FileChange {
                    kind: ChangeKind::Modified,
                    path: first,
                    previous_path: None,
                },
            };
            Some(change)
        })
        .collect()
}
