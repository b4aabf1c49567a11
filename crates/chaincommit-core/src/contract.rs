//! Pattern-matched chaincode event subscriptions.
//!
//! Each registered listener owns its own transport subscription, so removing
//! one listener never disturbs another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use regex::Regex;

use crate::error::GatewayError;
use crate::listener::{anchor, ContractListener};
use crate::registry::{ListenerId, ListenerRegistry};
use crate::transport::{ChannelTransport, TransportHandle};
use crate::types::{BlockEvent, ChaincodeEvent, ContractEvent};

/// Chaincode id and event name patterns. Both must match the whole string.
#[derive(Debug, Clone)]
pub struct ContractEventFilter {
    chaincode_id: Regex,
    event_name: Regex,
}

impl ContractEventFilter {
    /// Compile a filter from two regular expressions.
    pub fn new(chaincode_pattern: &str, event_pattern: &str) -> Result<Self, GatewayError> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| GatewayError::Other(format!("invalid pattern '{p}': {e}")))
        };
        Ok(Self::from_regex(&compile(chaincode_pattern)?, &compile(event_pattern)?))
    }

    pub fn from_regex(chaincode_id: &Regex, event_name: &Regex) -> Self {
        Self {
            chaincode_id: anchor(chaincode_id),
            event_name: anchor(event_name),
        }
    }

    /// Exactly `chaincode_id`, any event name when `event_pattern` is `None`.
    pub fn for_chaincode(chaincode_id: &str, event_pattern: Option<&str>) -> Result<Self, GatewayError> {
        Self::new(&regex::escape(chaincode_id), event_pattern.unwrap_or(".*"))
    }

    pub fn matches(&self, event: &ChaincodeEvent) -> bool {
        self.chaincode_id.is_match(&event.chaincode_id) && self.event_name.is_match(&event.event_name)
    }
}

/// Source of contract events for registered listeners.
pub trait ContractEventSource: Send + Sync {
    /// Register `listener` for events matching `filter`. Re-adding a listener
    /// that is already registered returns its existing handle.
    fn add_contract_listener(
        &self,
        filter: ContractEventFilter,
        listener: Arc<dyn ContractListener>,
    ) -> Result<ListenerId, GatewayError>;

    /// No-op for unknown handles.
    fn remove_contract_listener(&self, id: ListenerId);

    /// Remove every listener. Never fails.
    fn close(&self);
}

struct ContractSubscription {
    handle: TransportHandle,
    active: Arc<AtomicBool>,
}

/// [`ContractEventSource`] backed by transport chaincode subscriptions.
pub struct ChannelContractEventSource {
    transport: Arc<dyn ChannelTransport>,
    listeners: ListenerRegistry<dyn ContractListener, ContractSubscription>,
}

impl ChannelContractEventSource {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transport,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn subscribe(
        &self,
        filter: &ContractEventFilter,
        listener: &Arc<dyn ContractListener>,
    ) -> Result<ContractSubscription, GatewayError> {
        let active = Arc::new(AtomicBool::new(true));
        let (flag, target) = (active.clone(), listener.clone());
        let handle = self.transport.register_chaincode_listener(
            filter,
            Arc::new(move |block: &Arc<BlockEvent>, tx_id: &str, event: &ChaincodeEvent| {
                if flag.load(Ordering::SeqCst) {
                    target.received_event(&ContractEvent::new(block.clone(), tx_id, event));
                }
            }),
        )?;
        Ok(ContractSubscription { handle, active })
    }

    fn release(&self, subscription: ContractSubscription) {
        subscription.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.unregister_chaincode_listener(&subscription.handle) {
            tracing::warn!(handle = %subscription.handle, error = %e, "Ignoring chaincode listener unregister failure");
        }
    }
}

impl ContractEventSource for ChannelContractEventSource {
    fn add_contract_listener(
        &self,
        filter: ContractEventFilter,
        listener: Arc<dyn ContractListener>,
    ) -> Result<ListenerId, GatewayError> {
        self.listeners
            .add_with(listener, |listener| self.subscribe(&filter, listener), |surplus| self.release(surplus))
    }

    fn remove_contract_listener(&self, id: ListenerId) {
        if let Some(subscription) = self.listeners.remove(id) {
            self.release(subscription);
        }
    }

    fn close(&self) {
        for (_, subscription) in self.listeners.drain() {
            self.release(subscription);
        }
    }
}
