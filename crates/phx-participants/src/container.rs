//! ---
//! phx_section: "06-update-participants"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Container redeploy participant."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Rebuilds the bot image and replaces the running container, preferring a
//! compose file when the runtime supports it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use phx_common::ContainerConfig;
use phx_core::{
    timestamp_suffix, BuildStrategy, ChangeSet, ContainerInfo, Result, UpdateDetail, UpdateError,
    UpdateInfo, UpdateOptions, UpdateParticipant, UpdateResult, CONTAINER_PARTICIPANT,
};
use phx_logging::ScopedLogger;
use phx_process::{run_checked, ProcessOutput, ProcessRequest, ProcessRunner};
use serde::Deserialize;
use tracing::debug;

const MOUNTS_FORMAT: &str = "--format={{json .Mounts}}";

/// What `docker inspect` reported about the managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerPresence {
    Missing,
    Stopped,
    Running,
}

#[derive(Debug, Default)]
struct RedeployState {
    compose_available: Option<bool>,
    last_log_capture: Option<PathBuf>,
}

/// Container redeploy participant backed by the docker CLI.
#[derive(Debug)]
pub struct ContainerParticipant {
    config: ContainerConfig,
    runner: Arc<dyn ProcessRunner>,
    command_timeout: Duration,
    logger: ScopedLogger,
    state: Mutex<RedeployState>,
}

impl ContainerParticipant {
    pub fn new(
        config: ContainerConfig,
        runner: Arc<dyn ProcessRunner>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            config,
            runner,
            command_timeout,
            logger: ScopedLogger::new(CONTAINER_PARTICIPANT),
            state: Mutex::new(RedeployState::default()),
        }
    }

    /// Log file written by the most recent `backup()`, if the container was running.
    pub fn last_log_capture(&self) -> Option<PathBuf> {
        self.state.lock().last_log_capture.clone()
    }

    fn runtime<I, S>(&self, args: I) -> ProcessRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessRequest::new(&self.config.runtime)
            .args(args)
            .current_dir(&self.config.build_context)
            .timeout(self.command_timeout)
    }

    async fn checked(&self, request: ProcessRequest) -> Result<ProcessOutput> {
        Ok(run_checked(self.runner.as_ref(), &request).await?)
    }

    async fn runtime_version(&self) -> Result<String> {
        match self.runner.run(&self.runtime(["--version"])).await {
            Ok(output) if output.success() => Ok(output.stdout_trimmed().to_owned()),
            Ok(output) => Err(UpdateError::Validation(format!(
                "{} --version failed: {}",
                self.config.runtime,
                output.stderr.trim()
            ))),
            Err(err) => Err(UpdateError::Validation(format!(
                "{} is not available: {err}",
                self.config.runtime
            ))),
        }
    }

    async fn presence(&self) -> Result<ContainerPresence> {
        let output = self
            .runner
            .run(&self.runtime([
                "inspect",
                "--type",
                "container",
                "--format={{.State.Running}}",
                self.config.container_name.as_str(),
            ]))
            .await?;
        Ok(match (output.success(), output.stdout_trimmed()) {
            (false, _) => ContainerPresence::Missing,
            (true, "true") => ContainerPresence::Running,
            (true, _) => ContainerPresence::Stopped,
        })
    }

    async fn image_exists(&self) -> Result<bool> {
        let output = self
            .runner
            .run(&self.runtime(["image", "inspect", self.config.image_tag.as_str()]))
            .await?;
        Ok(output.success())
    }

    async fn compose_available(&self) -> Result<bool> {
        if !self.compose_path().exists() {
            return Ok(false);
        }
        let output = self.runner.run(&self.runtime(["compose", "version"])).await?;
        Ok(output.success())
    }

    fn compose_path(&self) -> PathBuf {
        if self.config.compose_file.is_absolute() {
            self.config.compose_file.clone()
        } else {
            self.config.build_context.join(&self.config.compose_file)
        }
    }

    async fn previous_mounts(&self) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(&self.runtime([
                "inspect",
                "--type",
                "container",
                MOUNTS_FORMAT,
                self.config.container_name.as_str(),
            ]))
            .await?;
        if !output.success() {
            return Ok(Vec::new());
        }
        parse_mounts(output.stdout_trimmed())
            .map_err(|err| UpdateError::execution("parse container mounts", err))
    }

    async fn container_id(&self) -> Result<String> {
        let output = self
            .checked(self.runtime([
                "inspect",
                "--type",
                "container",
                "--format={{.Id}}",
                self.config.container_name.as_str(),
            ]))
            .await?;
        Ok(output.stdout_trimmed().to_owned())
    }

    async fn remove_existing(&self, presence: ContainerPresence) -> Result<()> {
        let name = self.config.container_name.as_str();
        if presence == ContainerPresence::Running {
            self.checked(self.runtime(["stop", name])).await?;
            self.logger.info(format!("stopped {name}"));
        }
        if presence != ContainerPresence::Missing {
            self.checked(self.runtime(["rm", name])).await?;
            self.logger.info(format!("removed {name}"));
        }
        Ok(())
    }

    async fn deploy_with_compose(&self) -> Result<()> {
        let compose = self.compose_path();
        let compose_dir = compose.parent().unwrap_or_else(|| Path::new("."));
        let file = compose.display().to_string();
        self.checked(
            self.runtime(["compose", "-f", file.as_str(), "build"])
                .current_dir(compose_dir),
        )
        .await?;
        self.checked(
            self.runtime(["compose", "-f", file.as_str(), "up", "-d"])
                .current_dir(compose_dir),
        )
        .await?;
        Ok(())
    }

    async fn deploy_direct(&self, volumes: &[String]) -> Result<()> {
        let mut build = vec!["build".to_owned(), "-t".to_owned(), self.config.image_tag.clone()];
        if let Some(dockerfile) = &self.config.dockerfile {
            build.push("-f".to_owned());
            build.push(dockerfile.display().to_string());
        }
        build.push(".".to_owned());
        self.checked(self.runtime(build)).await?;

        let mut run = vec![
            "run".to_owned(),
            "-d".to_owned(),
            "--name".to_owned(),
            self.config.container_name.clone(),
        ];
        for volume in volumes {
            run.push("-v".to_owned());
            run.push(volume.clone());
        }
        run.push(self.config.image_tag.clone());
        let output = self.checked(self.runtime(run)).await?;
        debug!(container_id = %output.stdout_trimmed(), "container started");
        Ok(())
    }
}

#[async_trait]
impl UpdateParticipant for ContainerParticipant {
    fn name(&self) -> &str {
        CONTAINER_PARTICIPANT
    }

    async fn check_for_updates(&self, _options: &UpdateOptions) -> Result<UpdateInfo> {
        let runtime_version = self.runtime_version().await?;
        let presence = self.presence().await?;
        let image_exists = self.image_exists().await?;
        let info = ContainerInfo {
            runtime_version,
            container_name: self.config.container_name.clone(),
            image_tag: self.config.image_tag.clone(),
            container_exists: presence != ContainerPresence::Missing,
            container_running: presence == ContainerPresence::Running,
            image_exists,
        };
        let summary = format!(
            "{} is {}, image {} {}",
            info.container_name,
            match presence {
                ContainerPresence::Missing => "absent",
                ContainerPresence::Stopped => "stopped",
                ContainerPresence::Running => "running",
            },
            info.image_tag,
            if image_exists { "present" } else { "missing" }
        );
        // Any source change may require a rebuild.
        Ok(UpdateInfo::new(true, summary, UpdateDetail::Container(info)))
    }

    async fn pre_update_check(&self, _options: &UpdateOptions) -> Result<()> {
        let version = self.runtime_version().await?;
        let compose = self.compose_available().await?;
        self.state.lock().compose_available = Some(compose);
        self.logger.info(format!(
            "{version}; redeploy via {}",
            if compose { "compose" } else { "direct build" }
        ));
        Ok(())
    }

    async fn backup(&self) -> Result<()> {
        if self.presence().await? != ContainerPresence::Running {
            self.logger
                .info("container not running; no logs to capture");
            return Ok(());
        }
        let output = self
            .checked(self.runtime(["logs", self.config.container_name.as_str()]))
            .await?;
        tokio::fs::create_dir_all(&self.config.logs_dir).await?;
        let path = self.config.logs_dir.join(format!(
            "{}-{}.log",
            self.config.container_name,
            timestamp_suffix(Utc::now())
        ));
        let mut contents = output.stdout;
        contents.push_str(&output.stderr);
        tokio::fs::write(&path, contents).await?;
        self.logger
            .success(format!("captured container logs to {}", path.display()));
        self.state.lock().last_log_capture = Some(path);
        Ok(())
    }

    async fn update(&self, _options: &UpdateOptions) -> Result<UpdateResult> {
        let presence = self.presence().await?;
        let mounts = if presence == ContainerPresence::Missing {
            Vec::new()
        } else {
            self.previous_mounts().await?
        };
        let volumes = if self.config.volumes.is_empty() {
            mounts
        } else {
            self.config.volumes.clone()
        };
        self.remove_existing(presence).await?;

        let cached = self.state.lock().compose_available;
        let compose = match cached {
            Some(compose) => compose,
            None => self.compose_available().await?,
        };
        let strategy = if compose {
            self.deploy_with_compose().await?;
            BuildStrategy::Compose
        } else {
            self.deploy_direct(&volumes).await?;
            BuildStrategy::DirectBuild
        };

        if self.presence().await? != ContainerPresence::Running {
            return Err(UpdateError::Verification(format!(
                "{} is not running after redeploy",
                self.config.container_name
            )));
        }
        let container_id = self.container_id().await?;
        let summary = format!(
            "{} redeployed from {} ({:?})",
            self.config.container_name, self.config.image_tag, strategy
        );
        self.logger.success(&summary);
        Ok(UpdateResult::applied(
            summary,
            ChangeSet::Container {
                container_name: self.config.container_name.clone(),
                image_tag: self.config.image_tag.clone(),
                strategy,
                container_id,
            },
        ))
    }

    async fn rollback(&self) -> Result<()> {
        let name = self.config.container_name.as_str();
        match self.presence().await? {
            ContainerPresence::Running => {
                self.logger.info(format!("{name} already running"));
            }
            ContainerPresence::Stopped => {
                self.checked(self.runtime(["start", name])).await?;
                self.logger.success(format!("restarted {name}"));
            }
            ContainerPresence::Missing => {
                self.logger.warn(format!(
                    "{name} does not exist; restoring it needs a redeploy from the restored sources"
                ));
            }
        }
        Ok(())
    }
}

/// One entry of `docker inspect`'s `.Mounts` array.
#[derive(Debug, Deserialize)]
struct MountPoint {
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "Destination", default)]
    destination: String,
}

/// Renders mounts as `-v` specs; entries without a source are dropped.
fn parse_mounts(raw: &str) -> serde_json::Result<Vec<String>> {
    if raw.is_empty() || raw == "null" {
        return Ok(Vec::new());
    }
    let mounts: Vec<MountPoint> = serde_json::from_str(raw)?;
    Ok(mounts
        .into_iter()
        .filter(|mount| !mount.source.is_empty() && !mount.destination.is_empty())
        .map(|mount| format!("{}:{}", mount.source, mount.destination))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_testharness::{Scripted, ScriptedRunner};

    const INSPECT_STATE: &str = "docker inspect --type container --format={{.State.Running}} phoenix-bot";

    fn participant(
        runner: Arc<ScriptedRunner>,
        context: &Path,
        volumes: Vec<String>,
    ) -> ContainerParticipant {
        let config = ContainerConfig {
            build_context: context.to_path_buf(),
            logs_dir: context.join("logs"),
            volumes,
            ..ContainerConfig::default()
        };
        ContainerParticipant::new(config, runner, Duration::from_secs(5))
    }

    #[test]
    fn mounts_without_entries_or_source_are_ignored() {
        assert!(parse_mounts("").unwrap().is_empty());
        assert!(parse_mounts("null").unwrap().is_empty());
        assert!(parse_mounts("[]").unwrap().is_empty());
        let mounts = parse_mounts(r#"[{"Type":"tmpfs","Destination":"/tmp"}]"#).unwrap();
        assert!(mounts.is_empty());
        assert!(parse_mounts("/srv/data:/app/data").is_err());
    }

    #[tokio::test]
    async fn check_always_reports_update_with_runtime_state() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker --version", ProcessOutput::ok("Docker version 27.0.1\n"));
        runner.on(INSPECT_STATE, ProcessOutput::ok("true\n"));
        runner.on("docker image inspect", ProcessOutput::failed(1, "No such image"));
        let container = participant(runner, dir.path(), Vec::new());

        let info = container
            .check_for_updates(&UpdateOptions::default())
            .await
            .unwrap();
        assert!(info.has_update);
        let UpdateDetail::Container(detail) = info.detail else {
            panic!("unexpected detail");
        };
        assert!(detail.container_running);
        assert!(!detail.image_exists);
        assert_eq!(detail.runtime_version, "Docker version 27.0.1");
    }

    #[tokio::test]
    async fn missing_runtime_fails_precheck() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker --version", Scripted::SpawnError);
        let container = participant(runner, dir.path(), Vec::new());
        let err = container
            .pre_update_check(&UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Validation(_)));
    }

    #[tokio::test]
    async fn backup_captures_logs_of_running_container() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(INSPECT_STATE, ProcessOutput::ok("true\n"));
        runner.on("docker logs phoenix-bot", ProcessOutput::ok("bot online\n"));
        let container = participant(runner, dir.path(), Vec::new());

        container.backup().await.unwrap();
        let capture = container.last_log_capture().unwrap();
        let name = capture.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("phoenix-bot-") && name.ends_with(".log"));
        assert_eq!(std::fs::read_to_string(capture).unwrap(), "bot online\n");
    }

    #[tokio::test]
    async fn direct_redeploy_reuses_previous_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker --version", ProcessOutput::ok("Docker version 27.0.1"));
        runner.on_sequence(
            INSPECT_STATE,
            vec![
                ProcessOutput::ok("true\n").into(),
                ProcessOutput::ok("true\n").into(),
            ],
        );
        runner.on(
            "docker inspect --type container --format={{json .Mounts}}",
            ProcessOutput::ok(concat!(
                r#"[{"Type":"bind","Source":"/srv/bot data","Destination":"/app/data","RW":true},"#,
                r#"{"Type":"volume","Name":"auth","Source":"/var/lib/docker/volumes/auth/_data","Destination":"/app/auth"}]"#,
                "\n"
            )),
        );
        runner.on("docker stop phoenix-bot", ProcessOutput::ok("phoenix-bot"));
        runner.on("docker rm phoenix-bot", ProcessOutput::ok("phoenix-bot"));
        runner.on("docker build -t phoenix-bot:latest .", ProcessOutput::ok(""));
        runner.on("docker run -d", ProcessOutput::ok("f00d\n"));
        runner.on(
            "docker inspect --type container --format={{.Id}}",
            ProcessOutput::ok("f00dcafe\n"),
        );
        let container = participant(runner.clone(), dir.path(), Vec::new());

        container
            .pre_update_check(&UpdateOptions::default())
            .await
            .unwrap();
        let result = container.update(&UpdateOptions::default()).await.unwrap();
        assert!(result.success);
        let run = runner
            .requests()
            .into_iter()
            .find(|request| request.args.first().map(String::as_str) == Some("run"))
            .unwrap();
        assert_eq!(
            run.args,
            vec![
                "run",
                "-d",
                "--name",
                "phoenix-bot",
                "-v",
                "/srv/bot data:/app/data",
                "-v",
                "/var/lib/docker/volumes/auth/_data:/app/auth",
                "phoenix-bot:latest",
            ]
        );
        let ChangeSet::Container {
            strategy,
            container_id,
            ..
        } = result.changes
        else {
            panic!("unexpected change set");
        };
        assert_eq!(strategy, BuildStrategy::DirectBuild);
        assert_eq!(container_id, "f00dcafe");
        assert!(!runner.was_called("docker compose -f"));
    }

    #[tokio::test]
    async fn compose_redeploy_when_file_and_plugin_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("docker --version", ProcessOutput::ok("Docker version 27.0.1"));
        runner.on("docker compose version", ProcessOutput::ok("v2.29.0"));
        runner.on_sequence(
            INSPECT_STATE,
            vec![
                ProcessOutput::failed(1, "No such container").into(),
                ProcessOutput::ok("true\n").into(),
            ],
        );
        runner.on("docker compose -f", ProcessOutput::ok(""));
        runner.on(
            "docker inspect --type container --format={{.Id}}",
            ProcessOutput::ok("beef\n"),
        );
        let container = participant(runner.clone(), dir.path(), Vec::new());

        container
            .pre_update_check(&UpdateOptions::default())
            .await
            .unwrap();
        let result = container.update(&UpdateOptions::default()).await.unwrap();
        let ChangeSet::Container { strategy, .. } = result.changes else {
            panic!("unexpected change set");
        };
        assert_eq!(strategy, BuildStrategy::Compose);
        assert_eq!(runner.count("docker compose -f"), 2);
        assert!(!runner.was_called("docker stop"));
        assert!(!runner.was_called("docker build"));
    }

    #[tokio::test]
    async fn container_not_running_after_redeploy_is_verification_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_sequence(
            INSPECT_STATE,
            vec![
                ProcessOutput::failed(1, "No such container").into(),
                ProcessOutput::ok("false\n").into(),
            ],
        );
        runner.on("docker build", ProcessOutput::ok(""));
        runner.on("docker run", ProcessOutput::ok("dead\n"));
        let container = participant(
            runner,
            dir.path(),
            vec!["/srv/data:/app/data".to_owned()],
        );

        let err = container
            .update(&UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Verification(_)));
    }

    #[tokio::test]
    async fn rollback_starts_stopped_container_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on_sequence(
            INSPECT_STATE,
            vec![
                ProcessOutput::ok("false\n").into(),
                ProcessOutput::failed(1, "No such container").into(),
            ],
        );
        runner.on("docker start phoenix-bot", ProcessOutput::ok("phoenix-bot"));
        let container = participant(runner.clone(), dir.path(), Vec::new());

        container.rollback().await.unwrap();
        assert_eq!(runner.count("docker start"), 1);
        container.rollback().await.unwrap();
        assert_eq!(runner.count("docker start"), 1);
    }
}
