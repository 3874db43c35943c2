//! ---
//! phx_section: "06-update-participants"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Reference update participants."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
//! Reference participants: a whole-tree snapshot, a git source sync, and a
//! container redeploy. All external programs go through a shared
//! [`phx_process::ProcessRunner`].

pub mod container;
pub mod snapshot;
pub mod source_sync;

pub use container::ContainerParticipant;
pub use snapshot::{SnapshotParticipant, DiskSpace, SysinfoDiskSpace};
pub use source_sync::{SourceSyncParticipant, BACKUP_REF_PREFIX};
