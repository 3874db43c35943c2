//! ---
//! phx_section: "05-networking-external-interfaces"
//! phx_subsection: "binary"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Control CLI driving the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use phx_common::config::LoadedAppConfig;
use phx_common::AppConfig;
use phx_monitor::{new_registry, render_text, PipelineMetrics, SysinfoMonitor};
use phx_orchestrator::{CommandTestRunner, ParticipantRegistry, UpdateOrchestrator};
use phx_persistence::RunLedger;
use phx_process::{ProcessRunner, TokioProcessRunner};

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/phoenix.toml", "/etc/phoenix/phoenix.toml"];

/// An explicit `--config` wins over `PHX_CONFIG` and the default locations.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedAppConfig> {
    match explicit {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("unable to read config file {}", path.display()))?;
            let config: AppConfig = contents
                .parse()
                .with_context(|| format!("invalid config file {}", path.display()))?;
            Ok(LoadedAppConfig {
                config: config.absolutized()?,
                source: path.to_path_buf(),
            })
        }
        None => AppConfig::load_with_source(&DEFAULT_CONFIG_CANDIDATES[..]),
    }
}

/// Orchestrator wired to the production collaborators.
pub struct Pipeline {
    pub config: AppConfig,
    pub orchestrator: UpdateOrchestrator,
    pub ledger: Arc<RunLedger>,
    pub metrics: PipelineMetrics,
}

impl Pipeline {
    pub fn build(config: AppConfig) -> Result<Self> {
        let timeout = config.pipeline.command_timeout;
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner::new(timeout));
        let registry = ParticipantRegistry::from_config(&config, runner.clone())?;
        let ledger = Arc::new(
            RunLedger::open(&config.ledger.directory).with_context(|| {
                format!("unable to open run ledger in {}", config.ledger.directory.display())
            })?,
        );
        let metrics = PipelineMetrics::new(new_registry())?;
        let orchestrator = UpdateOrchestrator::new(registry)
            .with_store(ledger.clone())
            .with_monitor(Arc::new(SysinfoMonitor::new(&config.monitor)))
            .with_test_runner(Arc::new(CommandTestRunner::new(
                config.tests.clone(),
                runner,
                timeout,
            )))
            .with_metrics(metrics.clone());
        Ok(Self {
            config,
            orchestrator,
            ledger,
            metrics,
        })
    }

    pub fn write_metrics(&self, path: &Path) -> Result<()> {
        let text = render_text(&self.metrics.registry())?;
        fs::write(path, text)
            .with_context(|| format!("unable to write metrics to {}", path.display()))
    }
}
