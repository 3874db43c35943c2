//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Shared primitives and utilities for the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_order() -> Vec<ParticipantKind> {
    vec![
        ParticipantKind::Snapshot,
        ParticipantKind::SourceSync,
        ParticipantKind::Container,
    ]
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_remote_name() -> String {
    "origin".to_owned()
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_git_binary() -> String {
    "git".to_owned()
}

fn default_executable_extensions() -> Vec<String> {
    vec!["sh".to_owned()]
}

fn default_runtime() -> String {
    "docker".to_owned()
}

fn default_container_name() -> String {
    "phoenix-bot".to_owned()
}

fn default_image_tag() -> String {
    "phoenix-bot:latest".to_owned()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_container_logs() -> PathBuf {
    PathBuf::from("logs/containers")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("backups")
}

fn default_excludes() -> Vec<String> {
    ["node_modules", ".git", "target", "backups", "logs"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_headroom_factor() -> f64 {
    2.0
}

fn default_min_available_memory_mb() -> u64 {
    256
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_ledger_directory() -> PathBuf {
    PathBuf::from("state/ledger")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(3600)
}

/// Primary configuration object for the update pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "PHX_CONFIG";

    /// Load configuration from disk, respecting the `PHX_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: AppConfig = contents
            .parse()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.absolutized()
    }

    /// Resolve every relative path against the current working directory.
    pub fn absolutized(mut self) -> Result<Self> {
        fn abs(path: &mut PathBuf) -> Result<()> {
            let resolved = path
                .absolutize()
                .with_context(|| format!("unable to resolve path {}", path.display()))?
                .into_owned();
            *path = resolved;
            Ok(())
        }

        abs(&mut self.source.repo_path)?;
        abs(&mut self.container.build_context)?;
        abs(&mut self.container.compose_file)?;
        abs(&mut self.container.logs_dir)?;
        if let Some(dockerfile) = self.container.dockerfile.as_mut() {
            abs(dockerfile)?;
        }
        abs(&mut self.snapshot.source_root)?;
        abs(&mut self.snapshot.backup_root)?;
        abs(&mut self.ledger.directory)?;
        abs(&mut self.logging.directory)?;
        Ok(self)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.container.container_name.trim().is_empty() {
            return Err(anyhow!("container.container_name must not be empty"));
        }
        if self.source.default_branch.trim().is_empty() {
            return Err(anyhow!("source.default_branch must not be empty"));
        }
        if self.snapshot.headroom_factor < 1.0 {
            return Err(anyhow!(
                "snapshot.headroom_factor must be at least 1.0 (got {})",
                self.snapshot.headroom_factor
            ));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Participants the registry knows how to construct.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Snapshot,
    SourceSync,
    Container,
}

impl ParticipantKind {
    /// Stable participant name used in logs, options, and results.
    pub fn name(&self) -> &'static str {
        match self {
            ParticipantKind::Snapshot => "snapshot",
            ParticipantKind::SourceSync => "source_sync",
            ParticipantKind::Container => "container",
        }
    }
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fixed participant order; rollback walks it in reverse.
    #[serde(default = "default_order")]
    pub order: Vec<ParticipantKind>,
    /// Timeout applied to every external process invocation.
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.order.is_empty() {
            return Err(anyhow!("pipeline.order must list at least one participant"));
        }
        let mut seen = HashSet::new();
        for kind in &self.order {
            if !seen.insert(kind) {
                return Err(anyhow!("pipeline.order lists '{}' more than once", kind));
            }
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            order: default_order(),
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    /// Expected remote URL. Left untouched when unset.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    /// File extensions that get `0o755` after an update touches them.
    #[serde(default = "default_executable_extensions")]
    pub executable_extensions: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            remote_name: default_remote_name(),
            remote_url: None,
            default_branch: default_branch(),
            git_binary: default_git_binary(),
            executable_extensions: default_executable_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_container_name")]
    pub container_name: String,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    #[serde(default = "default_repo_path")]
    pub build_context: PathBuf,
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Volume bindings (`host:container[:mode]`). When empty the previous
    /// container's mounts are carried over.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default = "default_container_logs")]
    pub logs_dir: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            container_name: default_container_name(),
            image_tag: default_image_tag(),
            build_context: default_repo_path(),
            dockerfile: None,
            compose_file: default_compose_file(),
            volumes: Vec::new(),
            logs_dir: default_container_logs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_repo_path")]
    pub source_root: PathBuf,
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
    /// Directory names skipped while sizing and copying the tree.
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    #[serde(default = "default_headroom_factor")]
    pub headroom_factor: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            source_root: default_repo_path(),
            backup_root: default_backup_root(),
            exclude: default_excludes(),
            headroom_factor: default_headroom_factor(),
        }
    }
}

/// External command invoked as a regression suite.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsConfig {
    #[serde(default)]
    pub pre_update: Option<CommandSpec>,
    #[serde(default)]
    pub post_update: Option<CommandSpec>,
    #[serde(default)]
    pub post_rollback: Option<CommandSpec>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_min_available_memory_mb")]
    pub min_available_memory_mb: u64,
    #[serde(default = "default_sample_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sample_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_available_memory_mb: default_min_available_memory_mb(),
            sample_interval: default_sample_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_directory")]
    pub directory: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            directory: default_ledger_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
        }
    }
}
