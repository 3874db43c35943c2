//! ---
//! phx_section: "01-core-functionality"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Participant registry built from configuration."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use phx_common::{AppConfig, ParticipantKind};
use phx_core::ParticipantHandle;
use phx_participants::{ContainerParticipant, SnapshotParticipant, SourceSyncParticipant};
use phx_process::ProcessRunner;

/// Failure to assemble the participant list.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("participant `{0}` is registered more than once")]
    Duplicate(String),
    #[error("no participants configured")]
    Empty,
}

/// Participants in their fixed pipeline order, keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: IndexMap<String, ParticipantHandle>,
}

impl ParticipantRegistry {
    /// Register handles in the given order.
    pub fn new(handles: Vec<ParticipantHandle>) -> Result<Self, RegistryError> {
        if handles.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut participants = IndexMap::with_capacity(handles.len());
        for handle in handles {
            let name = handle.name().to_owned();
            if participants.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            participants.insert(name, handle);
        }
        Ok(Self { participants })
    }

    /// Construct the reference participants listed in `pipeline.order`.
    pub fn from_config(
        config: &AppConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, RegistryError> {
        let handles = config
            .pipeline
            .order
            .iter()
            .map(|kind| build_participant(*kind, config, runner.clone()))
            .collect();
        Self::new(handles)
    }

    pub fn get(&self, name: &str) -> Option<&ParticipantHandle> {
        self.participants.get(name)
    }

    /// Names in pipeline order.
    pub fn names(&self) -> Vec<&str> {
        self.participants.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ParticipantHandle> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

fn build_participant(
    kind: ParticipantKind,
    config: &AppConfig,
    runner: Arc<dyn ProcessRunner>,
) -> ParticipantHandle {
    let timeout = config.pipeline.command_timeout;
    match kind {
        ParticipantKind::Snapshot => Arc::new(SnapshotParticipant::new(config.snapshot.clone())),
        ParticipantKind::SourceSync => Arc::new(SourceSyncParticipant::new(
            config.source.clone(),
            runner,
            timeout,
        )),
        ParticipantKind::Container => Arc::new(ContainerParticipant::new(
            config.container.clone(),
            runner,
            timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phx_testharness::{Journal, RecordingParticipant, ScriptedRunner};

    #[test]
    fn default_config_follows_configured_order() {
        let config = AppConfig::default();
        let registry =
            ParticipantRegistry::from_config(&config, Arc::new(ScriptedRunner::new())).unwrap();
        let expected: Vec<&str> = config.pipeline.order.iter().map(|kind| kind.name()).collect();
        assert_eq!(registry.names(), expected);
    }

    #[test]
    fn custom_order_is_preserved() {
        let mut config = AppConfig::default();
        config.pipeline.order = vec![ParticipantKind::Container, ParticipantKind::SourceSync];
        let registry =
            ParticipantRegistry::from_config(&config, Arc::new(ScriptedRunner::new())).unwrap();
        assert_eq!(registry.names(), vec!["container", "source_sync"]);
        assert!(registry.get("snapshot").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let journal = Journal::new();
        let handles: Vec<ParticipantHandle> = vec![
            Arc::new(RecordingParticipant::new("a", journal.clone())),
            Arc::new(RecordingParticipant::new("a", journal)),
        ];
        assert_eq!(
            ParticipantRegistry::new(handles).unwrap_err(),
            RegistryError::Duplicate("a".into())
        );
        assert_eq!(
            ParticipantRegistry::new(Vec::new()).unwrap_err(),
            RegistryError::Empty
        );
    }
}
