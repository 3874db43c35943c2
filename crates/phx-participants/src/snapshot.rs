//! ---
//! phx_section: "06-update-participants"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Whole-tree filesystem snapshot participant."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use phx_common::SnapshotConfig;
use phx_core::{
    timestamp_suffix, ChangeSet, Result, SnapshotInfo, UpdateDetail, UpdateError, UpdateInfo,
    UpdateOptions, UpdateParticipant, UpdateResult,
};
use phx_logging::ScopedLogger;
use sysinfo::Disks;
use walkdir::WalkDir;

const PARTICIPANT_NAME: &str = "snapshot";
const BACKUP_DIR_PREFIX: &str = "backup-";
const PARTIAL_SUFFIX: &str = ".partial";

/// Source of free-space figures for the backup destination.
pub trait DiskSpace: Send + Sync + fmt::Debug {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space from the disk whose mount point is the longest prefix of the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoDiskSpace;

impl DiskSpace for SysinfoDiskSpace {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let existing = path
            .ancestors()
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| Path::new("/"));
        let resolved = existing.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| resolved.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted disk contains {}", resolved.display()),
                )
            })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CopyStats {
    files: u64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct SnapshotState {
    last_backup: Option<PathBuf>,
    /// Snapshot taken by `backup()` since the last precheck.
    run_snapshot: Option<(PathBuf, CopyStats)>,
}

/// Copies the working tree into timestamped backup directories.
#[derive(Debug)]
pub struct SnapshotParticipant {
    config: SnapshotConfig,
    disk: Arc<dyn DiskSpace>,
    logger: ScopedLogger,
    state: Mutex<SnapshotState>,
}

impl SnapshotParticipant {
    pub fn new(config: SnapshotConfig) -> Self {
        Self::with_disk_space(config, Arc::new(SysinfoDiskSpace))
    }

    pub fn with_disk_space(config: SnapshotConfig, disk: Arc<dyn DiskSpace>) -> Self {
        Self {
            config,
            disk,
            logger: ScopedLogger::new(PARTICIPANT_NAME),
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// Directory written by the most recent snapshot.
    pub fn last_backup(&self) -> Option<PathBuf> {
        self.state.lock().last_backup.clone()
    }

    async fn estimate(&self) -> Result<SnapshotInfo> {
        let root = self.config.source_root.clone();
        let filter = self.exclusion_filter();
        let stats = tokio::task::spawn_blocking(move || measure_tree(&root, &filter))
            .await
            .map_err(|err| UpdateError::execution("measure working tree", err))??;
        let available = self
            .disk
            .available_bytes(&self.config.backup_root)
            .map_err(|err| {
                UpdateError::Resource(format!(
                    "cannot read free space for {}: {err}",
                    self.config.backup_root.display()
                ))
            })?;
        let factor = self.config.headroom_factor;
        Ok(SnapshotInfo {
            required_bytes: stats.bytes,
            available_bytes: available,
            headroom_factor: factor,
            sufficient: available as f64 >= stats.bytes as f64 * factor,
        })
    }

    fn exclusion_filter(&self) -> Exclusions {
        Exclusions {
            names: self.config.exclude.clone(),
            backup_root: self.config.backup_root.clone(),
        }
    }

    fn next_backup_dir(&self) -> PathBuf {
        let stamp = timestamp_suffix(Utc::now());
        let mut candidate = self.config.backup_root.join(format!("{BACKUP_DIR_PREFIX}{stamp}"));
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self
                .config
                .backup_root
                .join(format!("{BACKUP_DIR_PREFIX}{stamp}-{attempt}"));
            attempt += 1;
        }
        candidate
    }

    async fn latest_backup(&self) -> Result<Option<PathBuf>> {
        let mut latest: Option<PathBuf> = None;
        let mut entries = match tokio::fs::read_dir(&self.config.backup_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(BACKUP_DIR_PREFIX) || !entry.file_type().await?.is_dir() {
                continue;
            }
            let newer = latest
                .as_ref()
                .and_then(|current| current.file_name())
                .and_then(|current| current.to_str())
                .map_or(true, |current| name > current);
            if newer {
                latest = Some(entry.path());
            }
        }
        Ok(latest)
    }

    async fn take_snapshot(&self) -> Result<(PathBuf, CopyStats)> {
        let destination = self.next_backup_dir();
        let from = self.config.source_root.clone();
        let to = destination.clone();
        let filter = self.exclusion_filter();
        let stats = tokio::task::spawn_blocking(move || snapshot_tree(&from, &to, &filter))
            .await
            .map_err(|err| UpdateError::execution("copy tree", err))??;
        self.logger.success(format!(
            "snapshot {} holds {} file(s), {} bytes",
            destination.display(),
            stats.files,
            stats.bytes
        ));
        self.state.lock().last_backup = Some(destination.clone());
        Ok((destination, stats))
    }

    async fn copy(&self, from: PathBuf, to: PathBuf, filter: Option<Exclusions>) -> Result<CopyStats> {
        let stats = tokio::task::spawn_blocking(move || copy_tree(&from, &to, filter.as_ref()))
            .await
            .map_err(|err| UpdateError::execution("copy tree", err))??;
        Ok(stats)
    }
}

#[async_trait]
impl UpdateParticipant for SnapshotParticipant {
    fn name(&self) -> &str {
        PARTICIPANT_NAME
    }

    async fn check_for_updates(&self, _options: &UpdateOptions) -> Result<UpdateInfo> {
        let info = self.estimate().await?;
        let summary = format!(
            "tree {} bytes, {} bytes free at {}",
            info.required_bytes,
            info.available_bytes,
            self.config.backup_root.display()
        );
        if info.sufficient {
            self.logger.info(&summary);
        } else {
            self.logger.warn(format!(
                "insufficient space for a snapshot ({summary}, {:.1}x headroom required)",
                info.headroom_factor
            ));
        }
        // The snapshot never has anything of its own to pull.
        Ok(UpdateInfo::new(false, summary, UpdateDetail::Snapshot(info)))
    }

    async fn pre_update_check(&self, _options: &UpdateOptions) -> Result<()> {
        self.state.lock().run_snapshot = None;
        let root = &self.config.backup_root;
        let resource = |err: io::Error| {
            UpdateError::Resource(format!("backup root {} is not writable: {err}", root.display()))
        };
        tokio::fs::create_dir_all(root).await.map_err(resource)?;
        let marker = root.join(format!(".phx-write-check-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&marker, b"ok").await.map_err(resource)?;
        tokio::fs::remove_file(&marker).await.map_err(resource)?;
        self.logger
            .info(format!("backup root {} is writable", root.display()));
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        let taken = self.take_snapshot().await?;
        self.state.lock().run_snapshot = Some(taken);
        Ok(())
    }

    async fn update(&self, _options: &UpdateOptions) -> Result<UpdateResult> {
        // Later backups (a git stash) may have changed the tree since; keep
        // this run's pre-update copy as the newest one.
        let taken = self.state.lock().run_snapshot.clone();
        let (backup_dir, stats, summary) = match taken {
            Some((backup_dir, stats)) => {
                let summary = format!("snapshot {} taken during backup", backup_dir.display());
                (backup_dir, stats, summary)
            }
            None => {
                let info = self.estimate().await?;
                if !info.sufficient {
                    self.logger.warn("skipping snapshot: insufficient space");
                    return Ok(UpdateResult::noop("snapshot skipped, insufficient space"));
                }
                let (backup_dir, stats) = self.take_snapshot().await?;
                let summary = format!("snapshot written to {}", backup_dir.display());
                (backup_dir, stats, summary)
            }
        };
        Ok(UpdateResult::applied(
            summary,
            ChangeSet::Snapshot {
                backup_dir,
                files_copied: stats.files,
                bytes_copied: stats.bytes,
            },
        ))
    }

    async fn rollback(&self) -> Result<()> {
        let Some(latest) = self.latest_backup().await? else {
            return Err(UpdateError::State(format!(
                "no snapshot under {}",
                self.config.backup_root.display()
            )));
        };
        let stats = self
            .copy(latest.clone(), self.config.source_root.clone(), None)
            .await?;
        self.logger.success(format!(
            "restored {} file(s) from {}",
            stats.files,
            latest.display()
        ));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Exclusions {
    names: Vec<String>,
    backup_root: PathBuf,
}

impl Exclusions {
    fn skips(&self, entry: &walkdir::DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return false;
        }
        if !self.backup_root.as_os_str().is_empty() && entry.path() == self.backup_root {
            return true;
        }
        entry
            .file_name()
            .to_str()
            .map(|name| self.names.iter().any(|excluded| excluded == name))
            .unwrap_or(false)
    }
}

fn measure_tree(root: &Path, filter: &Exclusions) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !filter.skips(e)) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(stats)
}

/// Copies into a hidden staging directory and renames it into place, so an
/// interrupted copy never shows up as a `backup-*` directory.
fn snapshot_tree(from: &Path, destination: &Path, filter: &Exclusions) -> io::Result<CopyStats> {
    let staging = staging_dir(destination);
    let copied = copy_tree(from, &staging, Some(filter))
        .and_then(|stats| fs::rename(&staging, destination).map(|()| stats));
    if copied.is_err() && staging.exists() {
        if let Err(err) = fs::remove_dir_all(&staging) {
            tracing::warn!(path = %staging.display(), error = %err, "unable to remove partial snapshot");
        }
    }
    copied
}

fn staging_dir(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

fn copy_tree(from: &Path, to: &Path, filter: Option<&Exclusions>) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    fs::create_dir_all(to)?;
    let walker = WalkDir::new(from)
        .into_iter()
        .filter_entry(|e| filter.map_or(true, |filter| !filter.skips(e)));
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            stats.bytes += fs::copy(entry.path(), &target)?;
            stats.files += 1;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let destination = fs::read_link(link)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(destination, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _target: &Path) -> io::Result<()> {
    tracing::debug!(path = %link.display(), "skipping symlink");
    Ok(())
}
