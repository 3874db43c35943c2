//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Resource monitor and metrics export utilities."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Host telemetry around pipeline runs: a `sysinfo` backed
//! [`phx_core::ResourceMonitor`] and the Prometheus counters the orchestrator
//! updates.

pub mod metrics;
mod resources;

pub use metrics::{new_registry, render_text, PipelineMetrics, SharedRegistry};
pub use resources::SysinfoMonitor;

pub use prometheus;
