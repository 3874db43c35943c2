//! ---
//! phx_section: "03-persistence-logging"
//! phx_subsection: "module"
//! phx_type: "source"
//! phx_scope: "code"
//! phx_description: "Run ledger and persistent store binding."
//! phx_version: "v0.1.0"
//! phx_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use phx_core::{
    timestamp_suffix, IntegrityReport, PersistentStore, RunRecord, StoreStatus,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{PersistenceError, Result};

/// Current ledger entry envelope version.
pub const LEDGER_VERSION: u16 = 1;

/// File name of the ledger inside its directory.
pub const LEDGER_FILE: &str = "runs.jsonl";

/// One line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Envelope version.
    pub version: u16,
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Timestamp when the entry was written.
    pub recorded_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized record.
    pub hash: String,
    /// The run being recorded.
    pub record: RunRecord,
}

/// Append-only JSON-lines ledger of orchestrator runs.
#[derive(Debug)]
pub struct RunLedger {
    directory: PathBuf,
    path: PathBuf,
    next_sequence: Mutex<u64>,
}

impl RunLedger {
    /// Open (creating if needed) the ledger stored under `directory`.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        let path = directory.join(LEDGER_FILE);
        let next_sequence = if path.exists() {
            last_sequence(&path)? + 1
        } else {
            1
        };
        Ok(Self {
            directory,
            path,
            next_sequence: Mutex::new(next_sequence),
        })
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a run and return its sequence number.
    pub fn append(&self, record: &RunRecord) -> Result<u64> {
        let mut next = self.next_sequence.lock();
        let entry = LedgerEntry {
            version: LEDGER_VERSION,
            sequence: *next,
            recorded_at: Utc::now(),
            hash: compute_hash(record)?,
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!(sequence = entry.sequence, run_id = %record.run_id, "run recorded");
        *next += 1;
        Ok(entry.sequence)
    }

    /// The most recent `limit` runs, newest first. Entries failing verification are skipped.
    pub fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self
            .entries()?
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.record),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable ledger entry");
                    None
                }
            })
            .collect();
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Re-verify every entry's hash.
    pub fn verify(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            ok: true,
            ..IntegrityReport::default()
        };
        for (index, entry) in self.entries()?.into_iter().enumerate() {
            report.records_checked += 1;
            if let Err(err) = entry {
                report.ok = false;
                report.corrupted.push(format!("line {}: {err}", index + 1));
            }
        }
        Ok(report)
    }

    /// Copy the ledger file to a timestamped sibling under `backups/`.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let backups = self.directory.join("backups");
        fs::create_dir_all(&backups)?;
        let target = backups.join(format!("runs-{}.jsonl", timestamp_suffix(Utc::now())));
        fs::copy(&self.path, &target)?;
        Ok(Some(target))
    }

    fn entries(&self) -> Result<Vec<Result<LedgerEntry>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_verified(&line));
        }
        Ok(entries)
    }

    fn writable(&self) -> Result<()> {
        let marker = self.directory.join(".phx-ledger-write-check");
        fs::write(&marker, b"ok")?;
        fs::remove_file(&marker)?;
        Ok(())
    }
}

fn parse_verified(line: &str) -> Result<LedgerEntry> {
    let entry: LedgerEntry = serde_json::from_str(line)?;
    if compute_hash(&entry.record)? != entry.hash {
        return Err(PersistenceError::HashMismatch {
            sequence: entry.sequence,
        });
    }
    Ok(entry)
}

fn last_sequence(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = 0;
    for line in reader.lines() {
        let line = line?;
        if let Ok(entry) = serde_json::from_str::<LedgerEntry>(&line) {
            last = last.max(entry.sequence);
        }
    }
    Ok(last)
}

fn compute_hash(record: &RunRecord) -> Result<String> {
    let serialized = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl PersistentStore for RunLedger {
    async fn check_status(&self) -> phx_core::Result<StoreStatus> {
        Ok(match self.writable() {
            Ok(()) => StoreStatus {
                healthy: true,
                detail: format!("ledger at {}", self.path.display()),
            },
            Err(err) => StoreStatus {
                healthy: false,
                detail: format!("ledger directory {} unusable: {err}", self.directory.display()),
            },
        })
    }

    async fn create_backup(&self) -> phx_core::Result<Option<PathBuf>> {
        Ok(self.backup()?)
    }

    async fn verify_integrity(&self) -> phx_core::Result<IntegrityReport> {
        Ok(self.verify()?)
    }

    async fn record_run(&self, record: &RunRecord) -> phx_core::Result<()> {
        self.append(record)?;
        Ok(())
    }
}
