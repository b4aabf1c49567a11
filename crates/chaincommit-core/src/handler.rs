//! Commit handlers: confirmation that one submitted transaction committed.
//!
//! State transitions:
//! - `Created` → `Listening`: `start_listening` subscribed to blocks and peer disconnects
//! - `Listening` → `Succeeded` / `Failed`: the strategy reached a verdict
//! - `Listening` → `Cancelled`: `cancel_listening`
//!
//! Terminal states are sticky. Subscriptions are released exactly once, on
//! the transition into a terminal state.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::block_source::BlockEventSource;
use crate::config::millis;
use crate::context::EventContext;
use crate::disconnect::{PeerDisconnectSource, PeerDisconnectSourceFactory};
use crate::error::GatewayError;
use crate::registry::{lock, ListenerId};
use crate::strategy::{
    AllCommitStrategy, AnyCommitStrategy, CommitOutcome, CommitStrategy, OutcomeLedger, PeerScope, Verdict,
};
use crate::types::{BlockEvent, PeerDisconnectEvent, PeerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Created,
    Listening,
    Succeeded,
    Failed,
    Cancelled,
}

impl CommitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Listening => write!(f, "listening"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Confirms the commit of a single transaction.
#[async_trait]
pub trait CommitHandler: Send + Sync {
    fn transaction_id(&self) -> &str;

    /// Subscribe to commit events. Call before submitting to the orderer.
    fn start_listening(&self) -> Result<(), GatewayError>;

    /// Wait until the commit succeeds or fails, or `timeout` elapses.
    ///
    /// A timeout leaves the handler listening; the caller may wait again.
    async fn wait_for_outcome(&self, timeout: Duration) -> Result<(), GatewayError>;

    /// Release all subscriptions. Idempotent; safe to call from any thread
    /// at any time, including while another task is waiting.
    fn cancel_listening(&self);

    fn state(&self) -> CommitState;
}

/// Handler that does not wait for any commit event.
pub struct NoOpCommitHandler {
    transaction_id: String,
}

impl NoOpCommitHandler {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
        }
    }
}

#[async_trait]
impl CommitHandler for NoOpCommitHandler {
    fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    fn start_listening(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn wait_for_outcome(&self, _timeout: Duration) -> Result<(), GatewayError> {
        Ok(())
    }

    fn cancel_listening(&self) {}

    fn state(&self) -> CommitState {
        CommitState::Succeeded
    }
}

// ─── Transaction commit handler ───────────────────────────────────────────────

#[derive(Default)]
struct Subscriptions {
    block: Option<ListenerId>,
    disconnects: Vec<(Arc<dyn PeerDisconnectSource>, ListenerId)>,
}

struct Progress {
    ledger: OutcomeLedger,
    failure: Option<GatewayError>,
    subscriptions: Subscriptions,
}

struct HandlerInner {
    transaction_id: String,
    strategy: Box<dyn CommitStrategy>,
    blocks: Arc<dyn BlockEventSource>,
    disconnects: Arc<PeerDisconnectSourceFactory>,
    progress: Mutex<Progress>,
    state: watch::Sender<CommitState>,
}

impl HandlerInner {
    fn state(&self) -> CommitState {
        *self.state.borrow()
    }

    fn received_block(&self, block: &Arc<BlockEvent>) {
        for tx in block
            .transaction_events
            .iter()
            .filter(|tx| tx.transaction_id == self.transaction_id)
        {
            let outcome = if tx.valid {
                CommitOutcome::Valid
            } else {
                CommitOutcome::Invalid
            };
            self.record(&tx.peer, outcome);
        }
    }

    fn record(&self, peer: &PeerRef, outcome: CommitOutcome) {
        let released = {
            let mut progress = lock(&self.progress);
            if self.state().is_terminal() || !progress.ledger.record(peer, outcome) {
                return;
            }
            tracing::debug!(
                transaction_id = %self.transaction_id,
                peer = %peer,
                outcome = ?outcome,
                "Recorded commit outcome"
            );
            let Some(verdict) = self.strategy.evaluate(&progress.ledger) else {
                return;
            };
            self.conclude(&mut progress, verdict)
        };
        self.release(released);
    }

    fn conclude(&self, progress: &mut Progress, verdict: Verdict) -> Subscriptions {
        let transaction_id = self.transaction_id.clone();
        let (state, failure) = match verdict {
            Verdict::Succeeded => (CommitState::Succeeded, None),
            Verdict::Rejected { peers } => (
                CommitState::Failed,
                Some(GatewayError::CommitRejected { transaction_id, peers }),
            ),
            Verdict::Unreachable { peers } => (
                CommitState::Failed,
                Some(GatewayError::AllPeersUnreachable { transaction_id, peers }),
            ),
        };
        match &failure {
            None => tracing::info!(transaction_id = %self.transaction_id, strategy = self.strategy.name(), "Transaction committed"),
            Some(e) => tracing::info!(transaction_id = %self.transaction_id, strategy = self.strategy.name(), error = %e, "Transaction commit failed"),
        }
        progress.failure = failure;
        self.state.send_replace(state);
        std::mem::take(&mut progress.subscriptions)
    }

    fn release(&self, subscriptions: Subscriptions) {
        if let Some(id) = subscriptions.block {
            self.blocks.remove_block_listener(id);
        }
        for (source, id) in subscriptions.disconnects {
            source.remove_disconnect_listener(id);
        }
    }

    fn subscribe(self: &Arc<Self>) -> Result<Subscriptions, (Subscriptions, GatewayError)> {
        let mut subscriptions = Subscriptions::default();

        let weak: Weak<HandlerInner> = Arc::downgrade(self);
        match self.blocks.add_block_listener(Arc::new(move |block: &Arc<BlockEvent>| {
            if let Some(inner) = weak.upgrade() {
                inner.received_block(block);
            }
        })) {
            Ok(id) => subscriptions.block = Some(id),
            Err(e) => return Err((subscriptions, e)),
        }

        let peers = lock(&self.progress).ledger.peers().to_vec();
        for peer in peers {
            let source = self.disconnects.get(&peer);
            let weak: Weak<HandlerInner> = Arc::downgrade(self);
            let target = peer.clone();
            let added = source.add_disconnect_listener(Arc::new(move |event: &PeerDisconnectEvent| {
                if event.peer != target {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.record(&event.peer, CommitOutcome::Disconnected);
                }
            }));
            match added {
                Ok(id) => subscriptions.disconnects.push((source, id)),
                Err(e) => return Err((subscriptions, e)),
            }
        }
        Ok(subscriptions)
    }
}

/// Commit handler for one transaction, driven by a [`CommitStrategy`] over
/// a fixed set of target peers.
pub struct TransactionCommitHandler {
    inner: Arc<HandlerInner>,
}

impl TransactionCommitHandler {
    /// `blocks` must deliver every peer's copy of a block; do not pass a
    /// number-ordered source here.
    pub fn new(
        transaction_id: impl Into<String>,
        strategy: Box<dyn CommitStrategy>,
        peers: Vec<PeerRef>,
        blocks: Arc<dyn BlockEventSource>,
        disconnects: Arc<PeerDisconnectSourceFactory>,
    ) -> Self {
        let (state, _) = watch::channel(CommitState::Created);
        Self {
            inner: Arc::new(HandlerInner {
                transaction_id: transaction_id.into(),
                strategy,
                blocks,
                disconnects,
                progress: Mutex::new(Progress {
                    ledger: OutcomeLedger::new(peers),
                    failure: None,
                    subscriptions: Subscriptions::default(),
                }),
                state,
            }),
        }
    }

    /// Snapshot of the per-peer outcomes recorded so far.
    pub fn ledger(&self) -> OutcomeLedger {
        lock(&self.inner.progress).ledger.clone()
    }

    fn fail(&self, error: GatewayError) -> GatewayError {
        let released = {
            let mut progress = lock(&self.inner.progress);
            if self.inner.state().is_terminal() {
                Subscriptions::default()
            } else {
                progress.failure = Some(error.clone());
                self.inner.state.send_replace(CommitState::Failed);
                std::mem::take(&mut progress.subscriptions)
            }
        };
        self.inner.release(released);
        error
    }

    fn outcome(&self, state: CommitState) -> Result<(), GatewayError> {
        match state {
            CommitState::Succeeded => Ok(()),
            CommitState::Cancelled => Err(GatewayError::CommitCancelled {
                transaction_id: self.inner.transaction_id.clone(),
            }),
            _ => Err(lock(&self.inner.progress)
                .failure
                .clone()
                .unwrap_or_else(|| GatewayError::Other(format!("commit handler is {state}")))),
        }
    }
}

#[async_trait]
impl CommitHandler for TransactionCommitHandler {
    fn transaction_id(&self) -> &str {
        &self.inner.transaction_id
    }

    fn start_listening(&self) -> Result<(), GatewayError> {
        let peers = {
            let progress = lock(&self.inner.progress);
            if self.inner.state() != CommitState::Created {
                return Ok(());
            }
            self.inner.state.send_replace(CommitState::Listening);
            progress.ledger.peers().len()
        };

        if peers == 0 {
            return Err(self.fail(GatewayError::AllPeersUnreachable {
                transaction_id: self.inner.transaction_id.clone(),
                peers: vec![],
            }));
        }

        let subscriptions = match self.inner.subscribe() {
            Ok(subscriptions) => subscriptions,
            Err((partial, e)) => {
                self.inner.release(partial);
                return Err(self.fail(e));
            }
        };

        let leftover = {
            let mut progress = lock(&self.inner.progress);
            if self.inner.state().is_terminal() {
                // concluded or cancelled while subscribing
                subscriptions
            } else {
                progress.subscriptions = subscriptions;
                Subscriptions::default()
            }
        };
        self.inner.release(leftover);

        tracing::debug!(transaction_id = %self.inner.transaction_id, peers, "Listening for commit");
        Ok(())
    }

    async fn wait_for_outcome(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut rx = self.inner.state.subscribe();
        let state = match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => self.inner.state(),
            Err(_) => {
                return Err(GatewayError::CommitTimeout {
                    transaction_id: self.inner.transaction_id.clone(),
                    timeout_ms: millis(timeout),
                })
            }
        };
        self.outcome(state)
    }

    fn cancel_listening(&self) {
        let released = {
            let mut progress = lock(&self.inner.progress);
            if !self.inner.state().is_terminal() {
                self.inner.state.send_replace(CommitState::Cancelled);
                tracing::debug!(transaction_id = %self.inner.transaction_id, "Commit listening cancelled");
            }
            std::mem::take(&mut progress.subscriptions)
        };
        self.inner.release(released);
    }

    fn state(&self) -> CommitState {
        self.inner.state()
    }
}

impl Drop for TransactionCommitHandler {
    fn drop(&mut self) {
        let released = std::mem::take(&mut lock(&self.inner.progress).subscriptions);
        self.inner.release(released);
    }
}

// ─── Policies ─────────────────────────────────────────────────────────────────

/// How a submitted transaction is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitPolicy {
    /// Do not wait for commit events.
    None,
    /// Every event-source peer in the caller's organization.
    #[default]
    OrgScopeAll,
    /// The first event-source peer in the caller's organization.
    OrgScopeAny,
    /// Every event-source peer on the channel.
    NetworkScopeAll,
    /// The first event-source peer on the channel.
    NetworkScopeAny,
}

impl CommitPolicy {
    pub fn scope(&self) -> Option<PeerScope> {
        match self {
            Self::None => None,
            Self::OrgScopeAll | Self::OrgScopeAny => Some(PeerScope::Organization),
            Self::NetworkScopeAll | Self::NetworkScopeAny => Some(PeerScope::Network),
        }
    }

    pub fn strategy(&self) -> Option<Box<dyn CommitStrategy>> {
        match self {
            Self::None => None,
            Self::OrgScopeAll | Self::NetworkScopeAll => Some(Box::new(AllCommitStrategy)),
            Self::OrgScopeAny | Self::NetworkScopeAny => Some(Box::new(AnyCommitStrategy)),
        }
    }

    /// Build a handler for `transaction_id`. The target peers are resolved now
    /// and stay fixed for the handler's lifetime.
    pub fn create_handler(&self, transaction_id: &str, context: &EventContext) -> Box<dyn CommitHandler> {
        match (self.scope(), self.strategy()) {
            (Some(scope), Some(strategy)) => Box::new(TransactionCommitHandler::new(
                transaction_id,
                strategy,
                context.peers(scope),
                context.commit_block_source(),
                context.disconnect_sources(),
            )),
            _ => Box::new(NoOpCommitHandler::new(transaction_id)),
        }
    }
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::OrgScopeAll => write!(f, "org-scope-all"),
            Self::OrgScopeAny => write!(f, "org-scope-any"),
            Self::NetworkScopeAll => write!(f, "network-scope-all"),
            Self::NetworkScopeAny => write!(f, "network-scope-any"),
        }
    }
}

impl FromStr for CommitPolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "org-scope-all" => Ok(Self::OrgScopeAll),
            "org-scope-any" => Ok(Self::OrgScopeAny),
            "network-scope-all" => Ok(Self::NetworkScopeAll),
            "network-scope-any" => Ok(Self::NetworkScopeAny),
            other => Err(GatewayError::Other(format!("unknown commit policy '{other}'"))),
        }
    }
}
