//! Channel transport boundary.
//!
//! [`ChannelTransport`] is what the network layer provides: raw block feeds
//! (any order, any multiplicity), chaincode event feeds, per-peer disconnect
//! notifications, and the channel's peer list. [`InMemoryChannel`] is an
//! in-process implementation used by tests and local tooling.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::contract::ContractEventFilter;
use crate::error::GatewayError;
use crate::listener::{BlockListener, ChaincodeEventListener, DisconnectListener};
use crate::registry::lock;
use crate::types::{BlockEvent, PeerDisconnectEvent, PeerRef};

/// Transport-issued subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub String);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstracts over the peer/channel network connection.
pub trait ChannelTransport: Send + Sync {
    /// Channel name.
    fn name(&self) -> &str;

    /// Subscribe to block events, replaying from `start_block` when given.
    fn register_block_listener(
        &self,
        start_block: Option<u64>,
        listener: Arc<dyn BlockListener>,
    ) -> Result<TransportHandle, GatewayError>;

    fn unregister_block_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError>;

    /// Subscribe to chaincode events matching `filter`.
    fn register_chaincode_listener(
        &self,
        filter: &ContractEventFilter,
        listener: Arc<dyn ChaincodeEventListener>,
    ) -> Result<TransportHandle, GatewayError>;

    fn unregister_chaincode_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError>;

    /// Subscribe to connection-loss notifications for one peer.
    fn register_disconnect_listener(
        &self,
        peer: &PeerRef,
        listener: Arc<dyn DisconnectListener>,
    ) -> Result<TransportHandle, GatewayError>;

    fn unregister_disconnect_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError>;

    /// Every peer joined to the channel.
    fn peers(&self) -> Vec<PeerRef>;
}

// ─── In-memory transport ──────────────────────────────────────────────────────

#[derive(Clone)]
enum Subscription {
    Block(Arc<dyn BlockListener>),
    Chaincode(ContractEventFilter, Arc<dyn ChaincodeEventListener>),
    Disconnect(PeerRef, Arc<dyn DisconnectListener>),
}

/// In-process channel: callers push blocks and disconnects, subscribers
/// receive them synchronously on the pushing thread.
///
/// Every block sent is kept so that block subscriptions with a start block
/// can replay history.
pub struct InMemoryChannel {
    name: String,
    peers: Mutex<Vec<PeerRef>>,
    history: Mutex<Vec<Arc<BlockEvent>>>,
    subscriptions: Mutex<HashMap<TransportHandle, (u64, Subscription)>>,
    next_handle: AtomicU64,
    fail_registration: AtomicBool,
    fail_unregistration: AtomicBool,
    registrations: AtomicU64,
}

impl InMemoryChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peers: Mutex::new(vec![]),
            history: Mutex::new(vec![]),
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            fail_registration: AtomicBool::new(false),
            fail_unregistration: AtomicBool::new(false),
            registrations: AtomicU64::new(0),
        }
    }

    pub fn add_peer(&self, peer: PeerRef) {
        lock(&self.peers).push(peer);
    }

    /// Make every subsequent registration fail (simulates a torn-down channel).
    pub fn fail_registrations(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent unregistration fail.
    pub fn fail_unregistrations(&self, fail: bool) {
        self.fail_unregistration.store(fail, Ordering::SeqCst);
    }

    /// Number of live subscriptions of any kind.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Total successful registrations since creation.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Deliver a block to every block and chaincode subscriber.
    ///
    /// Chaincode events are only emitted for valid transactions.
    pub fn send_block(&self, block: BlockEvent) {
        let block = Arc::new(block);
        lock(&self.history).push(block.clone());

        for (handle, subscription) in self.snapshot() {
            match subscription {
                Subscription::Block(listener) => {
                    if self.is_active(&handle) {
                        listener.received_block(&block);
                    }
                }
                Subscription::Chaincode(filter, listener) => {
                    for tx in block.transaction_events.iter().filter(|tx| tx.valid) {
                        for event in tx.chaincode_events.iter().filter(|e| filter.matches(e)) {
                            if self.is_active(&handle) {
                                listener.received_chaincode_event(&block, &tx.transaction_id, event);
                            }
                        }
                    }
                }
                Subscription::Disconnect(..) => {}
            }
        }
    }

    /// Signal that `event.peer` lost its connection.
    pub fn send_disconnect(&self, event: PeerDisconnectEvent) {
        for (handle, subscription) in self.snapshot() {
            if let Subscription::Disconnect(peer, listener) = subscription {
                if peer == event.peer && self.is_active(&handle) {
                    listener.peer_disconnected(&event);
                }
            }
        }
    }

    pub fn disconnect_peer(&self, peer: &PeerRef) {
        self.send_disconnect(PeerDisconnectEvent::new(peer.clone()));
    }

    fn snapshot(&self) -> Vec<(TransportHandle, Subscription)> {
        let subscriptions = lock(&self.subscriptions);
        let mut entries: Vec<_> = subscriptions
            .iter()
            .map(|(handle, (seq, sub))| (*seq, handle.clone(), sub.clone()))
            .collect();
        entries.sort_by_key(|(seq, ..)| *seq);
        entries.into_iter().map(|(_, h, s)| (h, s)).collect()
    }

    fn is_active(&self, handle: &TransportHandle) -> bool {
        lock(&self.subscriptions).contains_key(handle)
    }

    fn register(&self, subscription: Subscription) -> Result<TransportHandle, GatewayError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(GatewayError::Registration(format!(
                "channel {} has been shut down",
                self.name
            )));
        }
        let seq = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = TransportHandle(format!("{}-{seq}", self.name));
        lock(&self.subscriptions).insert(handle.clone(), (seq, subscription));
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn unregister(&self, handle: &TransportHandle) -> Result<(), GatewayError> {
        if self.fail_unregistration.load(Ordering::SeqCst) {
            return Err(GatewayError::Unregistration(format!(
                "channel {} has been shut down",
                self.name
            )));
        }
        lock(&self.subscriptions).remove(handle);
        Ok(())
    }
}

impl ChannelTransport for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_block_listener(
        &self,
        start_block: Option<u64>,
        listener: Arc<dyn BlockListener>,
    ) -> Result<TransportHandle, GatewayError> {
        let handle = self.register(Subscription::Block(listener.clone()))?;
        if let Some(start) = start_block {
            let replay: Vec<_> = lock(&self.history)
                .iter()
                .filter(|b| b.block_number >= start)
                .cloned()
                .collect();
            for block in replay {
                if self.is_active(&handle) {
                    listener.received_block(&block);
                }
            }
        }
        Ok(handle)
    }

    fn unregister_block_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError> {
        self.unregister(handle)
    }

    fn register_chaincode_listener(
        &self,
        filter: &ContractEventFilter,
        listener: Arc<dyn ChaincodeEventListener>,
    ) -> Result<TransportHandle, GatewayError> {
        self.register(Subscription::Chaincode(filter.clone(), listener))
    }

    fn unregister_chaincode_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError> {
        self.unregister(handle)
    }

    fn register_disconnect_listener(
        &self,
        peer: &PeerRef,
        listener: Arc<dyn DisconnectListener>,
    ) -> Result<TransportHandle, GatewayError> {
        self.register(Subscription::Disconnect(peer.clone(), listener))
    }

    fn unregister_disconnect_listener(&self, handle: &TransportHandle) -> Result<(), GatewayError> {
        self.unregister(handle)
    }

    fn peers(&self) -> Vec<PeerRef> {
        lock(&self.peers).clone()
    }
}
