// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only ledger stub for future distributed-ledger integration.
//!
//! Writes JSON lines to a local file and returns a pseudo transaction id
//! (the SHA-256 of the serialized line). The interface matches what a real
//! distributed ledger would expose so a production implementation can be
//! substituted without changing callers.

use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors from ledger appends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The record could not be serialized.
    #[error("ledger record not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The ledger file could not be written.
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only local ledger that mimics a distributed-ledger interface.
#[derive(Debug, Clone)]
pub struct LedgerStub {
    log_path: PathBuf,
}

impl LedgerStub {
    /// Open (creating if necessary) the ledger file at `log_path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the file cannot be created.
    pub fn open(log_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().append(true).create(true).open(log_path)?;
        Ok(Self {
            log_path: log_path.to_path_buf(),
        })
    }

    /// Append `record` to the ledger and return a pseudo transaction id.
    ///
    /// A `_ledger_ts` field holding the current UTC timestamp is added to
    /// the record before serialization. The returned hex SHA-256 of the
    /// written line stands in for a DLT transaction id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialize`] if `record` is not a JSON object
    /// representable as a line, [`LedgerError::Io`] on write failure.
    pub fn append(&self, record: &serde_json::Value) -> Result<String, LedgerError> {
        let mut enriched = match record {
            serde_json::Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("record".to_string(), other.clone());
                map
            }
        };
        enriched.insert(
            "_ledger_ts".to_string(),
            serde_json::Value::String(crate::now_utc()),
        );

        let mut line = serde_json::to_string(&serde_json::Value::Object(enriched))?;
        line.push('\n');

        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        file.write_all(line.as_bytes())?;

        let mut hasher = Sha256::new();
        hasher.update(line.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}
