//! Listener sessions and the checkpoint engine.
//!
//! A [`ListenerSession`] is one registration on a block source. Checkpointed
//! sessions route every block through a [`CheckpointPolicy`]: the listener is
//! invoked first and the checkpoint is updated afterwards, so a crash between
//! the two replays the work rather than skipping it.
//!
//! Invocations are serialized per session. The checkpointer is locked only
//! around each read and write, never while a listener runs, so listeners may
//! read their own checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::block_source::BlockEventSource;
use crate::checkpoint::SharedCheckpointer;
use crate::error::GatewayError;
use crate::listener::{BlockListener, TransactionListener};
use crate::registry::{lock, ListenerId};
use crate::types::BlockEvent;

/// Work done for the checkpointed block, with access to the checkpoint.
pub trait CheckpointPolicy: Send + Sync {
    /// Must not hold `checkpointer`'s lock while invoking a listener.
    fn process(&self, block: &Arc<BlockEvent>, checkpointer: &SharedCheckpointer) -> Result<(), GatewayError>;
}

/// The whole block is the unit of work.
pub struct BlockPolicy {
    listener: Arc<dyn BlockListener>,
}

impl BlockPolicy {
    pub fn new(listener: Arc<dyn BlockListener>) -> Self {
        Self { listener }
    }
}

impl CheckpointPolicy for BlockPolicy {
    fn process(&self, block: &Arc<BlockEvent>, _: &SharedCheckpointer) -> Result<(), GatewayError> {
        self.listener.received_block(block);
        Ok(())
    }
}

/// Each transaction is a unit of work. Transactions already recorded in the
/// checkpoint are skipped.
pub struct TransactionPolicy {
    listener: Arc<dyn TransactionListener>,
}

impl TransactionPolicy {
    pub fn new(listener: Arc<dyn TransactionListener>) -> Self {
        Self { listener }
    }
}

impl CheckpointPolicy for TransactionPolicy {
    fn process(&self, block: &Arc<BlockEvent>, checkpointer: &SharedCheckpointer) -> Result<(), GatewayError> {
        for transaction in &block.transaction_events {
            let id = &transaction.transaction_id;
            if checkpointer.is_processed(id)? {
                tracing::debug!(block = block.block_number, transaction_id = %id, "Skipping processed transaction");
                continue;
            }
            self.listener.received_transaction(block, transaction);
            checkpointer.add_transaction_id(id)?;
        }
        Ok(())
    }
}

struct CheckpointEngine {
    checkpointer: SharedCheckpointer,
    policy: Box<dyn CheckpointPolicy>,
    dispatch: Mutex<()>,
    failure: Mutex<Option<GatewayError>>,
}

impl CheckpointEngine {
    fn advance(&self, block: &Arc<BlockEvent>) -> Result<(), GatewayError> {
        let _dispatch = lock(&self.dispatch);
        let number = block.block_number;

        let expected = {
            let mut checkpointer = self.checkpointer.lock();
            match checkpointer.block_number()? {
                Some(expected) => expected,
                None => {
                    checkpointer.set_block_number(number)?;
                    number
                }
            }
        };
        if number != expected {
            tracing::debug!(block = number, expected, "Ignoring block outside checkpoint");
            return Ok(());
        }

        self.policy.process(block, &self.checkpointer)?;
        match number.checked_add(1) {
            Some(next) => self.checkpointer.set_block_number(next),
            None => {
                tracing::warn!(block = number, "Block number space exhausted; checkpoint not advanced");
                Ok(())
            }
        }
    }
}

impl BlockListener for CheckpointEngine {
    fn received_block(&self, block: &Arc<BlockEvent>) {
        if lock(&self.failure).is_some() {
            return;
        }
        if let Err(e) = self.advance(block) {
            tracing::error!(block = block.block_number, error = %e, "Checkpoint update failed; halting listener");
            *lock(&self.failure) = Some(e);
        }
    }
}

/// A listener registration on a block source.
///
/// Closing (or dropping) the session removes the listener. A checkpointed
/// session never closes its checkpointer; the checkpointer belongs to the
/// caller and outlives the session.
#[must_use = "dropping a session removes its listener"]
pub struct ListenerSession {
    source: Arc<dyn BlockEventSource>,
    id: ListenerId,
    engine: Option<Arc<CheckpointEngine>>,
    owns_source: bool,
    closed: AtomicBool,
}

impl ListenerSession {
    /// Register `listener` on `source` without checkpointing.
    pub fn attach(source: Arc<dyn BlockEventSource>, listener: Arc<dyn BlockListener>) -> Result<Self, GatewayError> {
        let id = source.add_block_listener(listener)?;
        Ok(Self {
            source,
            id,
            engine: None,
            owns_source: false,
            closed: AtomicBool::new(false),
        })
    }

    /// Register a checkpointed listener driven by `policy`.
    pub fn checkpointed(
        source: Arc<dyn BlockEventSource>,
        checkpointer: SharedCheckpointer,
        policy: impl CheckpointPolicy + 'static,
    ) -> Result<Self, GatewayError> {
        let engine = Arc::new(CheckpointEngine {
            checkpointer,
            policy: Box::new(policy),
            dispatch: Mutex::new(()),
            failure: Mutex::new(None),
        });
        let id = source.add_block_listener(engine.clone())?;
        tracing::info!(listener = %id, "Checkpointed listener session started");
        Ok(Self {
            source,
            id,
            engine: Some(engine),
            owns_source: false,
            closed: AtomicBool::new(false),
        })
    }

    /// Also close the source when the session closes. Used for sources
    /// dedicated to this session.
    pub fn owning_source(mut self) -> Self {
        self.owns_source = true;
        self
    }

    pub fn listener_id(&self) -> ListenerId {
        self.id
    }

    pub fn is_checkpointed(&self) -> bool {
        self.engine.is_some()
    }

    /// The checkpoint failure that halted this session, if any.
    pub fn failure(&self) -> Option<GatewayError> {
        self.engine.as_ref().and_then(|e| lock(&e.failure).clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove the listener. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.source.remove_block_listener(self.id);
        if self.owns_source {
            self.source.close();
        }
        if self.engine.is_some() {
            tracing::info!(listener = %self.id, "Checkpointed listener session closed");
        }
    }
}

impl Drop for ListenerSession {
    fn drop(&mut self) {
        self.close();
    }
}
