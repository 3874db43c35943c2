//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Run ledger and persistent store binding."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Append-only, hash-verified ledger of orchestrator runs. [`RunLedger`] is
//! the default [`phx_core::PersistentStore`].

use phx_core::UpdateError;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing the ledger.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a ledger line fails integrity verification.
    #[error("ledger entry {sequence} hash mismatch")]
    HashMismatch {
        /// Sequence number of the offending entry.
        sequence: u64,
    },
}

impl From<PersistenceError> for UpdateError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Io(err) => UpdateError::Io(err),
            other => UpdateError::State(format!("run ledger: {other}")),
        }
    }
}

pub mod ledger;

pub use ledger::{LedgerEntry, RunLedger, LEDGER_FILE, LEDGER_VERSION};
