//! Error types for event delivery and commit confirmation.

use thiserror::Error;

/// Errors surfaced by event sources, checkpoint sessions and commit handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Transaction {transaction_id} rejected by peers: {}", peers.join(", "))]
    CommitRejected {
        transaction_id: String,
        peers: Vec<String>,
    },

    #[error("Transaction {transaction_id}: no commit reported before all peers disconnected ({})", peers.join(", "))]
    AllPeersUnreachable {
        transaction_id: String,
        peers: Vec<String>,
    },

    #[error("Timed out after {timeout_ms}ms waiting for commit of transaction {transaction_id}")]
    CommitTimeout {
        transaction_id: String,
        timeout_ms: u64,
    },

    #[error("Commit listening cancelled for transaction {transaction_id}")]
    CommitCancelled { transaction_id: String },

    #[error("Listener registration failed: {0}")]
    Registration(String),

    #[error("Listener unregistration failed: {0}")]
    Unregistration(String),

    #[error("Checkpoint I/O error: {0}")]
    CheckpointIo(String),

    #[error("Checkpoint data corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Returns `true` if peers decided against the commit (rejection or total disconnect).
    pub fn is_commit_failure(&self) -> bool {
        matches!(
            self,
            Self::CommitRejected { .. } | Self::AllPeersUnreachable { .. }
        )
    }

    /// Returns `true` if the wait expired. The transaction may still commit later.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CommitTimeout { .. })
    }

    /// Returns `true` for checkpoint persistence failures.
    pub fn is_checkpoint_failure(&self) -> bool {
        matches!(self, Self::CheckpointIo(_) | Self::CheckpointCorrupt(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::CheckpointIo(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        Self::CheckpointCorrupt(e.to_string())
    }
}
