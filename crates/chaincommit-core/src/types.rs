//! Shared event types for the delivery pipeline.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ─── Peers ────────────────────────────────────────────────────────────────────

/// A network peer as known to this client.
#[derive(Debug)]
pub struct Peer {
    /// Display name (e.g. `"peer0.org1.example.com"`).
    pub name: String,
    /// Organization (MSP) id the peer belongs to.
    pub organization: String,
    /// Whether the peer delivers block events to this client.
    pub event_source: bool,
}

/// Shared handle to a [`Peer`].
///
/// Equality and hashing use the identity of the underlying allocation, never
/// the peer's fields: two connections to peers with the same name are still
/// two distinct peers.
#[derive(Clone)]
pub struct PeerRef(Arc<Peer>);

impl PeerRef {
    /// An event-source peer in `organization`.
    pub fn new(name: impl Into<String>, organization: impl Into<String>) -> Self {
        Self::with_roles(name, organization, true)
    }

    pub fn with_roles(
        name: impl Into<String>,
        organization: impl Into<String>,
        event_source: bool,
    ) -> Self {
        Self(Arc::new(Peer {
            name: name.into(),
            organization: organization.into(),
            event_source,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn organization(&self) -> &str {
        &self.0.organization
    }

    pub fn is_event_source(&self) -> bool {
        self.0.event_source
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for PeerRef {}

impl Hash for PeerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerRef").field(&self.0.name).finish()
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// A peer's connection was lost.
#[derive(Debug, Clone)]
pub struct PeerDisconnectEvent {
    pub peer: PeerRef,
    /// Transport-reported reason, if any.
    pub cause: Option<String>,
}

impl PeerDisconnectEvent {
    pub fn new(peer: PeerRef) -> Self {
        Self { peer, cause: None }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

// ─── Blocks and transactions ──────────────────────────────────────────────────

/// A chaincode event as emitted during transaction execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub event_name: String,
    pub payload: Option<Vec<u8>>,
}

impl ChaincodeEvent {
    pub fn new(chaincode_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            chaincode_id: chaincode_id.into(),
            event_name: event_name.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// The validation result of one transaction as reported by one peer.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    pub transaction_id: String,
    /// The peer that reported this transaction.
    pub peer: PeerRef,
    pub valid: bool,
    pub chaincode_events: Vec<ChaincodeEvent>,
}

impl TransactionEvent {
    pub fn new(transaction_id: impl Into<String>, peer: PeerRef, valid: bool) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            peer,
            valid,
            chaincode_events: vec![],
        }
    }

    pub fn with_chaincode_event(mut self, event: ChaincodeEvent) -> Self {
        self.chaincode_events.push(event);
        self
    }

    /// Contract events emitted by this transaction, tied to their originating block.
    pub fn contract_events(&self, block: &Arc<BlockEvent>) -> Vec<ContractEvent> {
        self.chaincode_events
            .iter()
            .map(|ce| ContractEvent::new(block.clone(), &self.transaction_id, ce))
            .collect()
    }
}

/// A block notification. Immutable once delivered.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub block_number: u64,
    pub transaction_events: Vec<TransactionEvent>,
}

impl BlockEvent {
    pub fn new(block_number: u64, transaction_events: Vec<TransactionEvent>) -> Self {
        Self {
            block_number,
            transaction_events,
        }
    }

    /// An empty block (no transactions).
    pub fn empty(block_number: u64) -> Self {
        Self::new(block_number, vec![])
    }
}

/// A contract event derived from a block. Read-only, never persisted.
#[derive(Debug, Clone)]
pub struct ContractEvent {
    chaincode_id: String,
    name: String,
    payload: Option<Vec<u8>>,
    transaction_id: String,
    block: Arc<BlockEvent>,
}

impl ContractEvent {
    pub fn new(block: Arc<BlockEvent>, transaction_id: &str, event: &ChaincodeEvent) -> Self {
        Self {
            chaincode_id: event.chaincode_id.clone(),
            name: event.event_name.clone(),
            payload: event.payload.clone(),
            transaction_id: transaction_id.to_string(),
            block,
        }
    }

    pub fn chaincode_id(&self) -> &str {
        &self.chaincode_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// The block this event was delivered in.
    pub fn block(&self) -> &Arc<BlockEvent> {
        &self.block
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
