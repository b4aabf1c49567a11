//! Checkpoints: the persisted cursor of a listener.
//!
//! A checkpoint holds the next block number the listener expects and the ids
//! of transactions already processed within that block. Advancing the block
//! number clears the transaction ids. An unset block number means "start
//! from the next block seen".

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::registry::lock;

/// Snapshot of a checkpoint's state, as stored by durable backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Next block to process. `None` until the first block is seen.
    pub block_number: Option<u64>,
    /// Transactions already processed within `block_number`.
    #[serde(default)]
    pub transaction_ids: BTreeSet<String>,
    /// Unix timestamp of the last write.
    #[serde(default)]
    pub updated_at: i64,
}

/// Persistent listener cursor.
///
/// Implementations must make each setter durable before returning.
pub trait Checkpointer: Send {
    fn block_number(&self) -> Result<Option<u64>, GatewayError>;

    /// Move to `block_number`, clearing the processed transaction ids.
    fn set_block_number(&mut self, block_number: u64) -> Result<(), GatewayError>;

    fn transaction_ids(&self) -> Result<BTreeSet<String>, GatewayError>;

    fn add_transaction_id(&mut self, transaction_id: &str) -> Result<(), GatewayError>;

    fn is_processed(&self, transaction_id: &str) -> Result<bool, GatewayError> {
        Ok(self.transaction_ids()?.contains(transaction_id))
    }

    /// Release backend resources. The checkpoint's contents are kept.
    fn close(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Checkpointer kept in memory; lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    record: CheckpointRecord,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: CheckpointRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn block_number(&self) -> Result<Option<u64>, GatewayError> {
        Ok(self.record.block_number)
    }

    fn set_block_number(&mut self, block_number: u64) -> Result<(), GatewayError> {
        self.record.block_number = Some(block_number);
        self.record.transaction_ids.clear();
        self.record.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    fn transaction_ids(&self) -> Result<BTreeSet<String>, GatewayError> {
        Ok(self.record.transaction_ids.clone())
    }

    fn add_transaction_id(&mut self, transaction_id: &str) -> Result<(), GatewayError> {
        self.record.transaction_ids.insert(transaction_id.to_string());
        self.record.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    fn is_processed(&self, transaction_id: &str) -> Result<bool, GatewayError> {
        Ok(self.record.transaction_ids.contains(transaction_id))
    }
}

/// A checkpointer shared between sessions and their listeners.
///
/// Each call takes the lock for that one operation only. Use [`lock`](Self::lock)
/// for a read-modify-write sequence, and never hold the guard while calling
/// listener code.
#[derive(Clone)]
pub struct SharedCheckpointer {
    inner: Arc<Mutex<Box<dyn Checkpointer>>>,
}

impl SharedCheckpointer {
    pub fn new(checkpointer: impl Checkpointer + 'static) -> Self {
        Self::from_box(Box::new(checkpointer))
    }

    pub fn from_box(checkpointer: Box<dyn Checkpointer>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(checkpointer)),
        }
    }

    /// Exclusive access for a read-modify-write sequence.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Checkpointer>> {
        lock(&self.inner)
    }

    pub fn block_number(&self) -> Result<Option<u64>, GatewayError> {
        self.lock().block_number()
    }

    pub fn set_block_number(&self, block_number: u64) -> Result<(), GatewayError> {
        self.lock().set_block_number(block_number)
    }

    pub fn transaction_ids(&self) -> Result<BTreeSet<String>, GatewayError> {
        self.lock().transaction_ids()
    }

    pub fn add_transaction_id(&self, transaction_id: &str) -> Result<(), GatewayError> {
        self.lock().add_transaction_id(transaction_id)
    }

    pub fn is_processed(&self, transaction_id: &str) -> Result<bool, GatewayError> {
        self.lock().is_processed(transaction_id)
    }

    pub fn close(&self) -> Result<(), GatewayError> {
        self.lock().close()
    }

    /// Whether both handles refer to the same checkpointer.
    pub fn same_as(&self, other: &SharedCheckpointer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCheckpointer").finish_non_exhaustive()
    }
}

/// Opens checkpointers by caller-chosen identity.
pub trait CheckpointStore: Send + Sync {
    /// Open (creating if needed) the checkpoint named `id`.
    fn open(&self, id: &str) -> Result<SharedCheckpointer, GatewayError>;

    /// Delete the checkpoint named `id`. Deleting an absent checkpoint is not an error.
    fn delete(&self, id: &str) -> Result<(), GatewayError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory checkpoint store. Opening the same id twice returns the same
/// checkpointer, so state survives across sessions of one process.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, SharedCheckpointer>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn open(&self, id: &str) -> Result<SharedCheckpointer, GatewayError> {
        Ok(lock(&self.data)
            .entry(id.to_string())
            .or_insert_with(|| SharedCheckpointer::new(MemoryCheckpointer::new()))
            .clone())
    }

    fn delete(&self, id: &str) -> Result<(), GatewayError> {
        lock(&self.data).remove(id);
        Ok(())
    }
}
