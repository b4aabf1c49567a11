//! The caller-built event context for one channel.
//!
//! An [`EventContext`] owns the channel's shared sources and is the entry
//! point for listener registration and commit handler construction.
//!
//! ```text
//!   ChannelTransport ── ChannelBlockEventSource ─┬─ OrderedBlockEventSource ── block / contract sessions
//!                                                └─ TransactionCommitHandler (every peer's copy)
//!                   ── ChannelContractEventSource ── plain contract listeners
//!                   ── PeerDisconnectSourceFactory ── TransactionCommitHandler
//! ```

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::block_source::{BlockEventSource, ChannelBlockEventSource, OrderedBlockEventSource};
use crate::checkpoint::SharedCheckpointer;
use crate::config::EventConfig;
use crate::contract::{ChannelContractEventSource, ContractEventFilter, ContractEventSource};
use crate::disconnect::PeerDisconnectSourceFactory;
use crate::error::GatewayError;
use crate::handler::{CommitHandler, CommitPolicy};
use crate::listener::{contract_filter, from_contract, transaction_from_contract, BlockListener, ContractListener};
use crate::registry::{ListenerId, ListenerRegistry};
use crate::session::{BlockPolicy, ListenerSession, TransactionPolicy};
use crate::strategy::PeerScope;
use crate::transport::ChannelTransport;
use crate::types::PeerRef;

/// Where a registration starts and whether it is checkpointed.
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Replay from this block when the checkpoint does not name one.
    pub start_block: Option<u64>,
    /// Resume from, and record progress in, this checkpoint.
    pub checkpointer: Option<SharedCheckpointer>,
}

impl ListenOptions {
    pub fn from_block(start_block: u64) -> Self {
        Self {
            start_block: Some(start_block),
            checkpointer: None,
        }
    }

    pub fn checkpointed(checkpointer: SharedCheckpointer) -> Self {
        Self {
            start_block: None,
            checkpointer: Some(checkpointer),
        }
    }

    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = Some(start_block);
        self
    }

    fn is_live(&self) -> bool {
        self.start_block.is_none() && self.checkpointer.is_none()
    }
}

enum ContractRegistration {
    Source(ListenerId),
    Session(ListenerSession),
}

/// Shared event plumbing for one channel.
pub struct EventContext {
    config: EventConfig,
    transport: Arc<dyn ChannelTransport>,
    channel_blocks: Arc<ChannelBlockEventSource>,
    ordered_blocks: Arc<OrderedBlockEventSource>,
    contracts: Arc<ChannelContractEventSource>,
    disconnects: Arc<PeerDisconnectSourceFactory>,
    block_listeners: ListenerRegistry<dyn BlockListener, ListenerSession>,
    contract_listeners: ListenerRegistry<dyn ContractListener, ContractRegistration>,
}

impl EventContext {
    pub fn new(transport: Arc<dyn ChannelTransport>, config: EventConfig) -> Self {
        let channel_blocks = Arc::new(ChannelBlockEventSource::new(transport.clone()));
        let ordered_blocks = Arc::new(OrderedBlockEventSource::new(channel_blocks.clone()));
        Self {
            config,
            contracts: Arc::new(ChannelContractEventSource::new(transport.clone())),
            disconnects: Arc::new(PeerDisconnectSourceFactory::for_transport(transport.clone())),
            transport,
            channel_blocks,
            ordered_blocks,
            block_listeners: ListenerRegistry::new(),
            contract_listeners: ListenerRegistry::new(),
        }
    }

    /// Replace the peer disconnect factory, e.g. to inject test sources.
    pub fn with_disconnect_factory(mut self, factory: PeerDisconnectSourceFactory) -> Self {
        self.disconnects = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn channel_name(&self) -> &str {
        self.transport.name()
    }

    /// Event-source peers in `scope`, as of now.
    pub fn peers(&self, scope: PeerScope) -> Vec<PeerRef> {
        scope.resolve(&self.transport.peers(), &self.config.organization)
    }

    /// Live blocks in order, without gaps or duplicates.
    pub fn block_source(&self) -> Arc<dyn BlockEventSource> {
        self.ordered_blocks.clone()
    }

    /// Every peer's copy of every block, as delivered.
    pub fn commit_block_source(&self) -> Arc<dyn BlockEventSource> {
        self.channel_blocks.clone()
    }

    pub fn contract_source(&self) -> Arc<dyn ContractEventSource> {
        self.contracts.clone()
    }

    pub fn disconnect_sources(&self) -> Arc<PeerDisconnectSourceFactory> {
        self.disconnects.clone()
    }

    // ── Block listeners ──────────────────────────────────────────────────────

    /// Receive live blocks in order.
    pub fn add_block_listener(&self, listener: Arc<dyn BlockListener>) -> Result<ListenerId, GatewayError> {
        self.add_block_listener_with(listener, ListenOptions::default())
    }

    /// Receive blocks from a start block and/or with checkpointing.
    pub fn add_block_listener_with(
        &self,
        listener: Arc<dyn BlockListener>,
        options: ListenOptions,
    ) -> Result<ListenerId, GatewayError> {
        self.block_listeners.add_with(
            listener,
            |listener| self.open_block_session(listener, &options),
            |surplus| surplus.close(),
        )
    }

    fn open_block_session(
        &self,
        listener: &Arc<dyn BlockListener>,
        options: &ListenOptions,
    ) -> Result<ListenerSession, GatewayError> {
        let (source, dedicated) = self.source_for(options)?;
        let session = match options.checkpointer.clone() {
            Some(checkpointer) => ListenerSession::checkpointed(source, checkpointer, BlockPolicy::new(listener.clone()))?,
            None => ListenerSession::attach(source, listener.clone())?,
        };
        Ok(if dedicated { session.owning_source() } else { session })
    }

    /// No-op for unknown handles.
    pub fn remove_block_listener(&self, id: ListenerId) {
        if let Some(session) = self.block_listeners.remove(id) {
            session.close();
        }
    }

    // ── Contract listeners ───────────────────────────────────────────────────

    /// Receive live events from `chaincode_id` whose name fully matches
    /// `event_pattern` (every event when `None`).
    pub fn add_contract_listener(
        &self,
        chaincode_id: &str,
        event_pattern: Option<&str>,
        listener: Arc<dyn ContractListener>,
    ) -> Result<ListenerId, GatewayError> {
        self.add_contract_listener_with(chaincode_id, event_pattern, listener, ListenOptions::default())
    }

    /// Contract listener with replay and/or checkpointing. Checkpointed
    /// contract listeners record progress per transaction.
    pub fn add_contract_listener_with(
        &self,
        chaincode_id: &str,
        event_pattern: Option<&str>,
        listener: Arc<dyn ContractListener>,
        options: ListenOptions,
    ) -> Result<ListenerId, GatewayError> {
        self.contract_listeners.add_with(
            listener,
            |listener| self.open_contract_registration(chaincode_id, event_pattern, listener, &options),
            |surplus| self.release_contract(surplus),
        )
    }

    fn open_contract_registration(
        &self,
        chaincode_id: &str,
        event_pattern: Option<&str>,
        listener: &Arc<dyn ContractListener>,
        options: &ListenOptions,
    ) -> Result<ContractRegistration, GatewayError> {
        if options.is_live() {
            let filter = ContractEventFilter::for_chaincode(chaincode_id, event_pattern)?;
            let id = self.contracts.add_contract_listener(filter, listener.clone())?;
            return Ok(ContractRegistration::Source(id));
        }

        let name_pattern = event_pattern
            .map(|p| Regex::new(p).map_err(|e| GatewayError::Other(format!("invalid pattern '{p}': {e}"))))
            .transpose()?;
        let filtered = contract_filter(listener.clone(), chaincode_id, name_pattern);

        let (source, dedicated) = self.source_for(options)?;
        let session = match options.checkpointer.clone() {
            Some(checkpointer) => ListenerSession::checkpointed(
                source,
                checkpointer,
                TransactionPolicy::new(transaction_from_contract(filtered)),
            )?,
            None => ListenerSession::attach(source, from_contract(filtered))?,
        };
        Ok(ContractRegistration::Session(if dedicated {
            session.owning_source()
        } else {
            session
        }))
    }

    /// No-op for unknown handles.
    pub fn remove_contract_listener(&self, id: ListenerId) {
        if let Some(registration) = self.contract_listeners.remove(id) {
            self.release_contract(registration);
        }
    }

    /// The checkpoint failure that halted a checkpointed registration.
    pub fn listener_failure(&self, id: ListenerId) -> Option<GatewayError> {
        self.block_listeners
            .with_subscription(id, |session| session.failure())
            .or_else(|| {
                self.contract_listeners.with_subscription(id, |registration| match registration {
                    ContractRegistration::Session(session) => session.failure(),
                    ContractRegistration::Source(_) => None,
                })
            })
            .flatten()
    }

    fn release_contract(&self, registration: ContractRegistration) {
        match registration {
            ContractRegistration::Source(id) => self.contracts.remove_contract_listener(id),
            ContractRegistration::Session(session) => session.close(),
        }
    }

    /// Block source for a registration and whether it is dedicated to it.
    ///
    /// A checkpoint's block number wins over the requested start block. With
    /// neither the shared live source is used.
    fn source_for(&self, options: &ListenOptions) -> Result<(Arc<dyn BlockEventSource>, bool), GatewayError> {
        let checkpoint_block = match &options.checkpointer {
            Some(checkpointer) => checkpointer.block_number()?,
            None => None,
        };
        match checkpoint_block.or(options.start_block) {
            Some(start) => {
                tracing::debug!(channel = self.channel_name(), start, "Opening replay block source");
                let raw = Arc::new(ChannelBlockEventSource::from_block(self.transport.clone(), Some(start)));
                Ok((Arc::new(OrderedBlockEventSource::starting_at(raw, start)), true))
            }
            None => Ok((self.ordered_blocks.clone(), false)),
        }
    }

    // ── Commit handlers ──────────────────────────────────────────────────────

    /// Handler for `transaction_id` under the configured commit policy.
    pub fn create_commit_handler(&self, transaction_id: &str) -> Box<dyn CommitHandler> {
        self.create_commit_handler_with(transaction_id, self.config.commit_policy)
    }

    pub fn create_commit_handler_with(&self, transaction_id: &str, policy: CommitPolicy) -> Box<dyn CommitHandler> {
        policy.create_handler(transaction_id, self)
    }

    pub fn commit_timeout(&self) -> Duration {
        self.config.commit_timeout()
    }

    /// Remove every listener and release all transport subscriptions.
    /// Never fails.
    pub fn close(&self) {
        for (_, session) in self.block_listeners.drain() {
            session.close();
        }
        for (_, registration) in self.contract_listeners.drain() {
            self.release_contract(registration);
        }
        self.contracts.close();
        self.ordered_blocks.close();
        self.channel_blocks.close();
        self.disconnects.close_all();
        tracing::info!(channel = self.channel_name(), "Event context closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpointer, MemoryCheckpointer};
    use crate::registry::lock;
    use crate::transport::InMemoryChannel;
    use crate::types::{BlockEvent, ChaincodeEvent, ContractEvent, TransactionEvent};
    use std::sync::Mutex;

    fn context() -> (Arc<InMemoryChannel>, EventContext) {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        channel.add_peer(PeerRef::new("peer1", "Org1MSP"));
        channel.add_peer(PeerRef::new("peer2", "Org2MSP"));
        channel.add_peer(PeerRef::with_roles("peer3", "Org1MSP", false));
        let context = EventContext::new(channel.clone(), EventConfig::for_organization("Org1MSP"));
        (channel, context)
    }

    fn block_recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn BlockListener>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        (seen, Arc::new(move |b: &Arc<BlockEvent>| lock(&s).push(b.block_number)))
    }

    fn contract_block(number: u64, tx: &str, event_name: &str) -> BlockEvent {
        BlockEvent::new(
            number,
            vec![TransactionEvent::new(tx, PeerRef::new("peer1", "Org1MSP"), true)
                .with_chaincode_event(ChaincodeEvent::new("basic", event_name))],
        )
    }

    #[test]
    fn scoped_peers_are_event_sources() {
        let (_, context) = context();
        let org: Vec<_> = context.peers(PeerScope::Organization).iter().map(|p| p.name().to_string()).collect();
        assert_eq!(org, vec!["peer1"]);
        assert_eq!(context.peers(PeerScope::Network).len(), 2);
    }

    #[test]
    fn live_block_listener_is_ordered() {
        let (channel, context) = context();
        let (seen, listener) = block_recorder();
        let id = context.add_block_listener(listener.clone()).unwrap();
        assert_eq!(context.add_block_listener(listener).unwrap(), id);

        for n in [1, 3, 2, 2] {
            channel.send_block(BlockEvent::empty(n));
        }
        context.remove_block_listener(id);
        channel.send_block(BlockEvent::empty(4));
        assert_eq!(*lock(&seen), vec![1, 2, 3]);
    }

    #[test]
    fn replay_listener_starts_at_requested_block() {
        let (channel, context) = context();
        for n in 1..=4 {
            channel.send_block(BlockEvent::empty(n));
        }
        let (seen, listener) = block_recorder();
        let id = context.add_block_listener_with(listener, ListenOptions::from_block(2)).unwrap();
        channel.send_block(BlockEvent::empty(5));
        assert_eq!(*lock(&seen), vec![2, 3, 4, 5]);

        context.remove_block_listener(id);
        assert_eq!(channel.active_subscriptions(), 0);
    }

    #[test]
    fn checkpoint_block_wins_over_start_block() {
        let (channel, context) = context();
        for n in 1..=4 {
            channel.send_block(BlockEvent::empty(n));
        }
        let mut cp = MemoryCheckpointer::new();
        cp.set_block_number(3).unwrap();
        let checkpointer = SharedCheckpointer::new(cp);
        let (seen, listener) = block_recorder();
        context
            .add_block_listener_with(listener, ListenOptions::checkpointed(checkpointer.clone()).with_start_block(1))
            .unwrap();

        assert_eq!(*lock(&seen), vec![3, 4]);
        assert_eq!(checkpointer.block_number().unwrap(), Some(5));
    }

    #[test]
    fn live_contract_listener_filters_by_chaincode_and_name() {
        let (channel, context) = context();
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        let id = context
            .add_contract_listener(
                "basic",
                Some("Asset.*"),
                Arc::new(move |e: &ContractEvent| lock(&s).push(e.name().to_string())),
            )
            .unwrap();

        channel.send_block(contract_block(1, "tx1", "AssetCreated"));
        channel.send_block(contract_block(2, "tx2", "Transfer"));
        context.remove_contract_listener(id);
        channel.send_block(contract_block(3, "tx3", "AssetDeleted"));
        assert_eq!(*lock(&seen), vec!["AssetCreated"]);
    }

    #[test]
    fn checkpointed_contract_listener_records_transactions() {
        let (channel, context) = context();
        let checkpointer = SharedCheckpointer::new(MemoryCheckpointer::new());
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        let id = context
            .add_contract_listener_with(
                "basic",
                None,
                Arc::new(move |e: &ContractEvent| lock(&s).push(e.transaction_id().to_string())),
                ListenOptions::checkpointed(checkpointer.clone()),
            )
            .unwrap();

        channel.send_block(contract_block(7, "tx1", "AssetCreated"));
        assert_eq!(*lock(&seen), vec!["tx1"]);
        assert_eq!(checkpointer.block_number().unwrap(), Some(8));
        assert!(context.listener_failure(id).is_none());
    }

    #[test]
    fn replayed_and_live_contract_listeners_agree_on_invalid_transactions() {
        let (channel, context) = context();
        let block = || {
            let peer = PeerRef::new("peer1", "Org1MSP");
            BlockEvent::new(
                1,
                vec![
                    TransactionEvent::new("bad", peer.clone(), false)
                        .with_chaincode_event(ChaincodeEvent::new("basic", "Created")),
                    TransactionEvent::new("good", peer, true).with_chaincode_event(ChaincodeEvent::new("basic", "Created")),
                ],
            )
        };
        let recorder = || {
            let seen = Arc::new(Mutex::new(vec![]));
            let s = seen.clone();
            let listener: Arc<dyn ContractListener> =
                Arc::new(move |e: &ContractEvent| lock(&s).push(e.transaction_id().to_string()));
            (seen, listener)
        };

        let (live, listener) = recorder();
        context.add_contract_listener("basic", None, listener).unwrap();
        channel.send_block(block());

        let (replayed, listener) = recorder();
        context
            .add_contract_listener_with("basic", None, listener, ListenOptions::from_block(1))
            .unwrap();

        assert_eq!(*lock(&live), vec!["good"]);
        assert_eq!(*lock(&replayed), vec!["good"]);
    }

    #[test]
    fn invalid_event_pattern_is_rejected() {
        let (_, context) = context();
        let result = context.add_contract_listener_with(
            "basic",
            Some("("),
            Arc::new(|_: &ContractEvent| {}),
            ListenOptions::from_block(0),
        );
        assert!(matches!(result, Err(GatewayError::Other(_))));
    }

    #[test]
    fn close_releases_everything() {
        let (channel, context) = context();
        let (_, listener) = block_recorder();
        context.add_block_listener(listener).unwrap();
        context
            .add_contract_listener("basic", None, Arc::new(|_: &ContractEvent| {}))
            .unwrap();
        let handler = context.create_commit_handler("tx1");
        handler.start_listening().unwrap();
        assert!(channel.active_subscriptions() > 0);

        context.close();
        handler.cancel_listening();
        assert_eq!(channel.active_subscriptions(), 0);
    }

    #[test]
    fn none_policy_needs_no_events() {
        let (_, context) = context();
        let handler = context.create_commit_handler_with("tx1", CommitPolicy::None);
        assert_eq!(handler.state(), crate::handler::CommitState::Succeeded);
    }
}
