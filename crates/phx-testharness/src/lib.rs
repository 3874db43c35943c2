//! ---
//! phx_section: "15-testing-qa-runbook"
//! phx_subsection: "harness"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Test doubles for the process runner and participants."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Test doubles shared by the participant, orchestrator, and integration
//! test suites.

mod participant;
mod runner;

pub use participant::{Journal, LifecyclePhase, RecordingParticipant};
pub use runner::{Scripted, ScriptedRunner};
