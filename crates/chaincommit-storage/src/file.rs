//! JSON file checkpointer.
//!
//! The document is rewritten on every change: serialized to a sibling
//! temporary file, synced, then renamed over the original. A crash leaves
//! either the old or the new document on disk, never a torn one.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chaincommit_core::{CheckpointRecord, Checkpointer, GatewayError};

/// Checkpointer persisted as a JSON document at a fixed path.
#[derive(Debug)]
pub struct FileCheckpointer {
    path: PathBuf,
    record: CheckpointRecord,
}

impl FileCheckpointer {
    /// Load the checkpoint at `path`, or start unset if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let path = path.into();
        let record = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::CheckpointCorrupt(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => CheckpointRecord::default(),
            Err(e) => return Err(io_error(&path, e)),
        };
        tracing::debug!(path = %path.display(), block = ?record.block_number, "Opened checkpoint file");
        Ok(Self { path, record })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    /// Persist `next`, and only then make it the current state.
    fn commit(&mut self, mut next: CheckpointRecord) -> Result<(), GatewayError> {
        next.updated_at = chrono::Utc::now().timestamp();
        let json = serde_json::to_vec_pretty(&next)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(&json).map_err(|e| io_error(&tmp, e))?;
        file.sync_all().map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))?;

        self.record = next;
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> GatewayError {
    GatewayError::CheckpointIo(format!("{}: {e}", path.display()))
}

impl Checkpointer for FileCheckpointer {
    fn block_number(&self) -> Result<Option<u64>, GatewayError> {
        Ok(self.record.block_number)
    }

    fn set_block_number(&mut self, block_number: u64) -> Result<(), GatewayError> {
        self.commit(CheckpointRecord {
            block_number: Some(block_number),
            transaction_ids: BTreeSet::new(),
            updated_at: self.record.updated_at,
        })
    }

    fn transaction_ids(&self) -> Result<BTreeSet<String>, GatewayError> {
        Ok(self.record.transaction_ids.clone())
    }

    fn add_transaction_id(&mut self, transaction_id: &str) -> Result<(), GatewayError> {
        if self.record.transaction_ids.contains(transaction_id) {
            return Ok(());
        }
        let mut next = self.record.clone();
        next.transaction_ids.insert(transaction_id.to_string());
        self.commit(next)
    }

    fn is_processed(&self, transaction_id: &str) -> Result<bool, GatewayError> {
        Ok(self.record.transaction_ids.contains(transaction_id))
    }
}
