//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Shared primitives and utilities for the update pipeline."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Shared primitives for the Phoenix workspace: configuration loading,
//! tracing initialisation, and build version metadata.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, CommandSpec, ContainerConfig, LedgerConfig, LoggingConfig, MonitorConfig,
    ParticipantKind, PipelineConfig, SnapshotConfig, SourceConfig, TestsConfig, WatchConfig,
};
pub use logging::{init_tracing, LogFormat, LogGuard};
pub use version::VersionInfo;
