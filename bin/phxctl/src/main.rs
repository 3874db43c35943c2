//! ---
//! phx_section: "05-networking-external-interfaces"
//! phx_subsection: "binary"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Control CLI driving the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use phx_common::logging::init_tracing;
use phx_common::VersionInfo;
use phx_core::UpdateOptions;
use phx_logging::ScopedLogger;
use phx_orchestrator::PipelineError;
use tokio::signal;
use tokio::time::MissedTickBehavior;

mod pipeline;
mod render;

use pipeline::Pipeline;

/// Exit status when another run holds the pipeline.
const EXIT_BUSY: u8 = 75;

/// Scope tagged on the CLI's own log lines.
const SCOPE: &str = "phxctl";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Phoenix self-update control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[arg(long, global = true, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit machine readable JSON on stdout")]
    json: bool,

    #[arg(
        long = "metrics-file",
        global = true,
        value_name = "FILE",
        help = "Write Prometheus text metrics to FILE when the command finishes"
    )]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Check every participant for pending updates")]
    Check(RunArgs),
    #[command(about = "Run the full update pipeline")]
    Update(RunArgs),
    #[command(about = "Roll every participant back to its last backup")]
    Rollback(RunArgs),
    #[command(about = "Run the update pipeline periodically until interrupted")]
    Watch {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, value_name = "SECS", help = "Override watch.poll_interval")]
        interval: Option<u64>,
    },
    #[command(about = "Show recorded pipeline runs, newest first")]
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    #[arg(long, help = "Branch to sync instead of source.default_branch")]
    branch: Option<String>,
    #[arg(long, help = "Run every phase even when nothing reports an update")]
    force: bool,
    #[arg(long = "skip-backup", help = "Skip the backup phase")]
    skip_backup: bool,
    #[arg(long = "skip-container", help = "Leave the running container untouched")]
    skip_container: bool,
    #[arg(long = "skip", value_name = "PARTICIPANT", help = "Exclude a participant by name")]
    skip: Vec<String>,
    #[arg(long = "run-tests", help = "Run the configured regression suites")]
    run_tests: bool,
}

impl From<RunArgs> for UpdateOptions {
    fn from(args: RunArgs) -> Self {
        UpdateOptions {
            branch: args.branch,
            force: args.force,
            skip_backup: args.skip_backup,
            skip_container_redeploy: args.skip_container,
            skip_participants: args.skip.into_iter().collect(),
            run_tests: args.run_tests,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", VersionInfo::current().extended());
        return Ok(ExitCode::SUCCESS);
    }
    let Some(command) = cli.command else {
        eprintln!("no command given; see `phxctl --help`");
        return Ok(ExitCode::from(2));
    };

    let loaded = pipeline::load_config(cli.config.as_deref())?;
    let _log_guard = init_tracing(SCOPE, &loaded.config.logging)?;
    let logger = ScopedLogger::new(SCOPE);
    logger.info(format!("configuration loaded from {}", loaded.source.display()));

    let pipeline = Pipeline::build(loaded.config)?;
    let code = match command {
        Commands::Check(args) => {
            let summary = pipeline
                .orchestrator
                .check_for_updates(&args.into())
                .await;
            render::check(&summary, cli.json)?;
            ExitCode::SUCCESS
        }
        Commands::Update(args) => update_once(&pipeline, &args.into(), cli.json).await?,
        Commands::Rollback(args) => {
            match pipeline.orchestrator.rollback(&args.into()).await {
                Ok(summary) => {
                    render::rollback(&summary, cli.json)?;
                    if summary.is_clean() {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    }
                }
                Err(err) => render_error(&err, cli.json)?,
            }
        }
        Commands::Watch { run, interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(pipeline.config.watch.poll_interval);
            watch(&pipeline, &logger, &run.into(), interval, cli.json).await?
        }
        Commands::History { limit } => {
            let runs = pipeline.ledger.history(limit)?;
            render::history(&runs, cli.json)?;
            ExitCode::SUCCESS
        }
    };

    if let Some(path) = &cli.metrics_file {
        pipeline.write_metrics(path)?;
    }
    Ok(code)
}

async fn update_once(pipeline: &Pipeline, options: &UpdateOptions, json: bool) -> Result<ExitCode> {
    match pipeline.orchestrator.update(options).await {
        Ok(report) => {
            render::report(&report, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => render_error(&err, json),
    }
}

fn render_error(err: &PipelineError, json: bool) -> Result<ExitCode> {
    match err {
        PipelineError::Busy => {
            render::busy(json)?;
            Ok(ExitCode::from(EXIT_BUSY))
        }
        PipelineError::Failed(failure) => {
            render::failure(failure, json)?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Periodic updates until Ctrl-C. A run in progress always completes first.
async fn watch(
    pipeline: &Pipeline,
    logger: &ScopedLogger,
    options: &UpdateOptions,
    interval: Duration,
    json: bool,
) -> Result<ExitCode> {
    logger.info(format!("watch mode started, polling every {}s", interval.as_secs()));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = std::pin::pin!(signal::ctrl_c());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = update_once(pipeline, options, json).await {
                    logger.warn(format!("watch cycle could not report its result: {err}"));
                }
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    logger.warn(format!("unable to listen for Ctrl-C: {err}"));
                }
                logger.success("watch mode stopped");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}
