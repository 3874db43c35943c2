//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Primary orchestration and lifecycle management."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Drives [`phx_core::UpdateParticipant`] implementations through check,
//! precheck, backup, apply and verify, rolling back on failure.

pub mod orchestrator;
pub mod registry;
pub mod regression;

pub use orchestrator::{
    CheckSummary, ParticipantCheck, ParticipantOutcome, PipelineError, PipelineFailure,
    PipelineReport, PipelineState, RollbackFailure, RollbackSummary, UpdateOrchestrator,
};
pub use registry::{ParticipantRegistry, RegistryError};
pub use regression::CommandTestRunner;
