//! Listener traits and adapters between event granularities.
//!
//! Every trait has a blanket implementation for matching closures, so
//! `Arc::new(|block: &Arc<BlockEvent>| { ... })` is a valid block listener.

use std::sync::Arc;

use regex::Regex;

use crate::types::{BlockEvent, ChaincodeEvent, ContractEvent, PeerDisconnectEvent, TransactionEvent};

/// Receives whole blocks.
pub trait BlockListener: Send + Sync {
    fn received_block(&self, block: &Arc<BlockEvent>);
}

impl<F> BlockListener for F
where
    F: Fn(&Arc<BlockEvent>) + Send + Sync,
{
    fn received_block(&self, block: &Arc<BlockEvent>) {
        self(block)
    }
}

/// Receives individual transactions together with their block.
pub trait TransactionListener: Send + Sync {
    fn received_transaction(&self, block: &Arc<BlockEvent>, transaction: &TransactionEvent);
}

impl<F> TransactionListener for F
where
    F: Fn(&Arc<BlockEvent>, &TransactionEvent) + Send + Sync,
{
    fn received_transaction(&self, block: &Arc<BlockEvent>, transaction: &TransactionEvent) {
        self(block, transaction)
    }
}

/// Receives contract (chaincode) events.
pub trait ContractListener: Send + Sync {
    fn received_event(&self, event: &ContractEvent);
}

impl<F> ContractListener for F
where
    F: Fn(&ContractEvent) + Send + Sync,
{
    fn received_event(&self, event: &ContractEvent) {
        self(event)
    }
}

/// Receives peer connection-loss notifications.
pub trait DisconnectListener: Send + Sync {
    fn peer_disconnected(&self, event: &PeerDisconnectEvent);
}

impl<F> DisconnectListener for F
where
    F: Fn(&PeerDisconnectEvent) + Send + Sync,
{
    fn peer_disconnected(&self, event: &PeerDisconnectEvent) {
        self(event)
    }
}

/// Transport-level callback for a chaincode event subscription.
pub trait ChaincodeEventListener: Send + Sync {
    fn received_chaincode_event(
        &self,
        block: &Arc<BlockEvent>,
        transaction_id: &str,
        event: &ChaincodeEvent,
    );
}

impl<F> ChaincodeEventListener for F
where
    F: Fn(&Arc<BlockEvent>, &str, &ChaincodeEvent) + Send + Sync,
{
    fn received_chaincode_event(
        &self,
        block: &Arc<BlockEvent>,
        transaction_id: &str,
        event: &ChaincodeEvent,
    ) {
        self(block, transaction_id, event)
    }
}

// ─── Adapters ─────────────────────────────────────────────────────────────────

/// Block listener that forwards each transaction of the block in order.
pub fn from_transaction(listener: Arc<dyn TransactionListener>) -> Arc<dyn BlockListener> {
    Arc::new(move |block: &Arc<BlockEvent>| {
        for transaction in &block.transaction_events {
            listener.received_transaction(block, transaction);
        }
    })
}

/// Transaction listener that forwards the contract events of each valid
/// transaction. Invalid transactions emit no contract events.
pub fn transaction_from_contract(listener: Arc<dyn ContractListener>) -> Arc<dyn TransactionListener> {
    Arc::new(move |block: &Arc<BlockEvent>, transaction: &TransactionEvent| {
        if !transaction.valid {
            return;
        }
        for event in transaction.contract_events(block) {
            listener.received_event(&event);
        }
    })
}

/// Block listener that forwards every contract event in the block.
pub fn from_contract(listener: Arc<dyn ContractListener>) -> Arc<dyn BlockListener> {
    from_transaction(transaction_from_contract(listener))
}

/// Only forwards events from `chaincode_id` whose name fully matches `name_pattern`
/// (all names when `None`).
pub fn contract_filter(
    listener: Arc<dyn ContractListener>,
    chaincode_id: impl Into<String>,
    name_pattern: Option<Regex>,
) -> Arc<dyn ContractListener> {
    let chaincode_id = chaincode_id.into();
    let name_pattern = name_pattern.as_ref().map(anchor);
    Arc::new(move |event: &ContractEvent| {
        if event.chaincode_id() != chaincode_id {
            return;
        }
        if let Some(pattern) = &name_pattern {
            if !pattern.is_match(event.name()) {
                return;
            }
        }
        listener.received_event(event);
    })
}

/// Anchored copy of `pattern` that only matches whole strings.
pub(crate) fn anchor(pattern: &Regex) -> Regex {
    Regex::new(&format!("^(?:{})$", pattern.as_str())).unwrap_or_else(|_| pattern.clone())
}
