//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant contract and pipeline data model."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{UpdateInfo, UpdateOptions, UpdateResult};

/// A named unit of the update pipeline.
///
/// The orchestrator drives every participant through the same lifecycle, in
/// a fixed order:
///
/// 1. [`check_for_updates`](Self::check_for_updates) is a read-only check and
///    may run concurrently with other participants' checks.
/// 2. [`pre_update_check`](Self::pre_update_check) validates preconditions. An
///    error here guarantees nothing has been mutated.
/// 3. [`backup`](Self::backup) snapshots whatever the update is about to
///    change. With nothing to back up it succeeds as a no-op.
/// 4. [`update`](Self::update) performs the state transition.
/// 5. [`rollback`](Self::rollback) restores the most recent backup. The
///    orchestrator logs rollback errors instead of propagating them.
#[async_trait]
pub trait UpdateParticipant: Send + Sync + fmt::Debug {
    /// Unique participant name, also used as its log scope.
    fn name(&self) -> &str;

    /// Report whether an update is available. Must not mutate state.
    async fn check_for_updates(&self, options: &UpdateOptions) -> Result<UpdateInfo>;

    /// Validate preconditions before anything is mutated.
    async fn pre_update_check(&self, options: &UpdateOptions) -> Result<()>;

    /// Create a recoverable snapshot of the state `update` will change.
    async fn backup(&self) -> Result<()>;

    /// Apply the update.
    async fn update(&self, options: &UpdateOptions) -> Result<UpdateResult>;

    /// Restore the most recent snapshot created by `backup`.
    async fn rollback(&self) -> Result<()>;
}

/// Shared participant handle as held by the registry.
pub type ParticipantHandle = Arc<dyn UpdateParticipant>;
