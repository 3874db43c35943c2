//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant contract and pipeline data model."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Contract every update participant implements, the data that flows through
//! the pipeline, and the interfaces of the orchestrator's collaborators.

pub mod collaborators;
pub mod error;
pub mod participant;
pub mod types;

pub use collaborators::{
    IntegrityReport, MonitorReport, MonitorSession, NoopMonitor, NoopStore, NoopTestRunner,
    ParticipantRecord, PersistentStore, ResourceMonitor, ResourceStatus, RunOperation, RunRecord,
    StoreStatus, TestReport, TestRunner,
};
pub use error::{ErrorKind, Result, UpdateError};
pub use participant::{ParticipantHandle, UpdateParticipant};
pub use types::{
    timestamp_suffix, BuildStrategy, ChangeKind, ChangeSet, CommitInfo, ContainerInfo, DiffStat,
    FileChange, SnapshotInfo, SourceSyncInfo, UpdateDetail, UpdateInfo, UpdateOptions,
    UpdateResult, CONTAINER_PARTICIPANT,
};
