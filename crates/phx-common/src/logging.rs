//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Shared primitives and utilities for the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Subscriber setup for the control CLI.
//!
//! stdout belongs to rendered reports and `--json` output, so human-facing
//! log lines go to stderr. Every event is also appended as JSON to a daily
//! file so a failed run can be reconstructed from its participant scopes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PHX_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Available stderr log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Keeps the log file writer alive. Pending lines are flushed on drop, so hold
/// it until the command has finished.
#[must_use = "dropping the guard stops the log file writer"]
#[derive(Debug)]
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Install the process-wide subscriber for one CLI invocation.
///
/// The filter comes from `PHX_LOG`, then `RUST_LOG`, then `info`. The log
/// file is `<file_prefix or command>.log.<date>` under `config.directory`.
pub fn init_tracing(command: &str, config: &LoggingConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(command);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));

    let stderr_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed(),
        // Interactive runs: one short line per event.
        LogFormat::Pretty => fmt::layer()
            .compact()
            .without_time()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_ansi(false)
        .with_writer(file_writer)
        .boxed();

    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    // A second call in the same process keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(build_filter(&directive))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    debug!(command, log_dir = %config.directory.display(), filter = %directive, "logging ready");
    Ok(LogGuard { _file: file_guard })
}

/// First non-blank directive of `PHX_LOG` and `RUST_LOG`, else `info`.
fn filter_directive(phx_log: Option<String>, rust_log: Option<String>) -> String {
    [phx_log, rust_log]
        .into_iter()
        .flatten()
        .map(|directive| directive.trim().to_owned())
        .find(|directive| !directive.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("ignoring log filter {directive:?} ({err}); using {DEFAULT_DIRECTIVE}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phx_log_wins_over_rust_log() {
        let directive = filter_directive(
            Some("debug,phx_participants=trace".into()),
            Some("warn".into()),
        );
        assert_eq!(directive, "debug,phx_participants=trace");
    }

    #[test]
    fn blank_values_fall_through_to_info() {
        assert_eq!(filter_directive(Some("  ".into()), Some("warn".into())), "warn");
        assert_eq!(filter_directive(None, Some(String::new())), DEFAULT_DIRECTIVE);
        assert_eq!(filter_directive(None, None), DEFAULT_DIRECTIVE);
    }

    #[test]
    fn malformed_directive_still_yields_a_filter() {
        let filter = build_filter("phx_core=[");
        assert_eq!(filter.to_string(), DEFAULT_DIRECTIVE);
    }
}
