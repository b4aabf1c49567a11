//! Per-peer connection-loss notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::GatewayError;
use crate::listener::DisconnectListener;
use crate::registry::{lock, ListenerId, ListenerRegistry};
use crate::transport::{ChannelTransport, TransportHandle};
use crate::types::{PeerDisconnectEvent, PeerRef};

/// Signals when a single peer's event connection is lost.
pub trait PeerDisconnectSource: Send + Sync {
    fn peer(&self) -> &PeerRef;

    /// Idempotent by listener identity.
    fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) -> Result<ListenerId, GatewayError>;

    /// No-op for unknown handles.
    fn remove_disconnect_listener(&self, id: ListenerId);

    /// Remove all listeners and release the transport subscription. Never fails.
    fn close(&self);
}

struct Fanout {
    listeners: ListenerRegistry<dyn DisconnectListener>,
}

/// Disconnect source backed by one transport subscription for the peer. The
/// subscription exists only while at least one listener is registered.
pub struct ChannelPeerDisconnectSource {
    peer: PeerRef,
    transport: Arc<dyn ChannelTransport>,
    fanout: Arc<Fanout>,
    upstream: Mutex<Option<(TransportHandle, Arc<AtomicBool>)>>,
}

impl ChannelPeerDisconnectSource {
    pub fn new(peer: PeerRef, transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            peer,
            transport,
            fanout: Arc::new(Fanout {
                listeners: ListenerRegistry::new(),
            }),
            upstream: Mutex::new(None),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.fanout.listeners.len()
    }

    fn register_upstream(&self) -> Result<(TransportHandle, Arc<AtomicBool>), GatewayError> {
        let active = Arc::new(AtomicBool::new(true));
        let (flag, fanout): (_, Weak<Fanout>) = (active.clone(), Arc::downgrade(&self.fanout));
        let handle = self.transport.register_disconnect_listener(
            &self.peer,
            Arc::new(move |event: &PeerDisconnectEvent| {
                if !flag.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(fanout) = fanout.upgrade() {
                    fanout.listeners.for_each(|listener| listener.peer_disconnected(event));
                }
            }),
        )?;
        Ok((handle, active))
    }

    fn release_upstream(&self, upstream: (TransportHandle, Arc<AtomicBool>)) {
        let (handle, active) = upstream;
        active.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.unregister_disconnect_listener(&handle) {
            tracing::warn!(peer = %self.peer, error = %e, "Ignoring disconnect listener unregister failure");
        }
    }
}

impl PeerDisconnectSource for ChannelPeerDisconnectSource {
    fn peer(&self) -> &PeerRef {
        &self.peer
    }

    fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) -> Result<ListenerId, GatewayError> {
        let mut upstream = lock(&self.upstream);
        if upstream.is_none() {
            *upstream = Some(self.register_upstream()?);
        }
        Ok(self.fanout.listeners.add(listener))
    }

    /// The transport subscription is released with the last listener.
    fn remove_disconnect_listener(&self, id: ListenerId) {
        let mut upstream = lock(&self.upstream);
        if self.fanout.listeners.remove(id).is_none() || !self.fanout.listeners.is_empty() {
            return;
        }
        if let Some(released) = upstream.take() {
            drop(upstream);
            self.release_upstream(released);
        }
    }

    fn close(&self) {
        let mut upstream = lock(&self.upstream);
        self.fanout.listeners.drain();
        if let Some(released) = upstream.take() {
            drop(upstream);
            self.release_upstream(released);
        }
    }
}

type SourceCreator = dyn Fn(&PeerRef) -> Arc<dyn PeerDisconnectSource> + Send + Sync;

/// Hands out one disconnect source per peer.
///
/// `get` creates a source on first use and returns the same instance after
/// that. `set` installs a replacement and closes the one it displaces.
pub struct PeerDisconnectSourceFactory {
    creator: Arc<SourceCreator>,
    sources: Mutex<HashMap<PeerRef, Arc<dyn PeerDisconnectSource>>>,
}

impl PeerDisconnectSourceFactory {
    pub fn new(creator: Arc<SourceCreator>) -> Self {
        Self {
            creator,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Factory creating [`ChannelPeerDisconnectSource`]s on `transport`.
    pub fn for_transport(transport: Arc<dyn ChannelTransport>) -> Self {
        Self::new(Arc::new(move |peer: &PeerRef| {
            Arc::new(ChannelPeerDisconnectSource::new(peer.clone(), transport.clone())) as Arc<dyn PeerDisconnectSource>
        }))
    }

    pub fn get(&self, peer: &PeerRef) -> Arc<dyn PeerDisconnectSource> {
        lock(&self.sources)
            .entry(peer.clone())
            .or_insert_with(|| (self.creator)(peer))
            .clone()
    }

    pub fn set(&self, peer: &PeerRef, source: Arc<dyn PeerDisconnectSource>) {
        let replaced = lock(&self.sources).insert(peer.clone(), source);
        if let Some(old) = replaced {
            old.close();
        }
    }

    /// Close and forget every source handed out so far.
    pub fn close_all(&self) {
        let sources: Vec<_> = lock(&self.sources).drain().map(|(_, s)| s).collect();
        for source in sources {
            source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryChannel;
    use std::sync::atomic::AtomicU32;

    fn counter() -> (Arc<AtomicU32>, Arc<dyn DisconnectListener>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move |_: &PeerDisconnectEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn forwards_disconnects_for_its_peer() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let peer = PeerRef::new("peer1", "Org1MSP");
        let source = ChannelPeerDisconnectSource::new(peer.clone(), channel.clone());
        let (count, listener) = counter();
        source.add_disconnect_listener(listener).unwrap();

        channel.disconnect_peer(&PeerRef::new("peer1", "Org1MSP"));
        assert_eq!(count.load(Ordering::SeqCst), 0, "same name, different peer");

        channel.disconnect_peer(&peer);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_transport_subscription_for_many_listeners() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let source = ChannelPeerDisconnectSource::new(PeerRef::new("peer1", "Org1MSP"), channel.clone());
        let (_, a) = counter();
        let (_, b) = counter();
        source.add_disconnect_listener(a).unwrap();
        source.add_disconnect_listener(b).unwrap();
        assert_eq!(channel.active_subscriptions(), 1);

        source.close();
        assert_eq!(channel.active_subscriptions(), 0);
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let peer = PeerRef::new("peer1", "Org1MSP");
        let source = ChannelPeerDisconnectSource::new(peer.clone(), channel.clone());
        let (count, listener) = counter();
        let id = source.add_disconnect_listener(listener).unwrap();
        source.remove_disconnect_listener(id);
        source.remove_disconnect_listener(id);

        channel.disconnect_peer(&peer);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn last_listener_out_releases_transport() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let source = ChannelPeerDisconnectSource::new(PeerRef::new("peer1", "Org1MSP"), channel.clone());
        let (_, a) = counter();
        let (_, b) = counter();
        let a = source.add_disconnect_listener(a).unwrap();
        let b = source.add_disconnect_listener(b).unwrap();

        source.remove_disconnect_listener(a);
        assert_eq!(channel.active_subscriptions(), 1);
        source.remove_disconnect_listener(b);
        assert_eq!(channel.active_subscriptions(), 0);

        let (_, c) = counter();
        source.add_disconnect_listener(c).unwrap();
        assert_eq!(channel.active_subscriptions(), 1);
    }

    #[test]
    fn factory_returns_same_instance_per_peer() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let factory = PeerDisconnectSourceFactory::for_transport(channel);
        let peer1 = PeerRef::new("peer1", "Org1MSP");
        let peer2 = PeerRef::new("peer2", "Org1MSP");

        assert!(Arc::ptr_eq(&factory.get(&peer1), &factory.get(&peer1)));
        assert!(!Arc::ptr_eq(&factory.get(&peer1), &factory.get(&peer2)));
    }

    #[test]
    fn factory_override_closes_replaced_source() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        let factory = PeerDisconnectSourceFactory::for_transport(channel.clone());
        let peer = PeerRef::new("peer1", "Org1MSP");

        let (count, listener) = counter();
        factory.get(&peer).add_disconnect_listener(listener).unwrap();
        assert_eq!(channel.active_subscriptions(), 1);

        let replacement: Arc<dyn PeerDisconnectSource> =
            Arc::new(ChannelPeerDisconnectSource::new(peer.clone(), channel.clone()));
        factory.set(&peer, replacement.clone());
        assert_eq!(channel.active_subscriptions(), 0);
        assert!(Arc::ptr_eq(&factory.get(&peer), &replacement));

        channel.disconnect_peer(&peer);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registration_failure_is_surfaced() {
        let channel = Arc::new(InMemoryChannel::new("mychannel"));
        channel.fail_registrations(true);
        let source = ChannelPeerDisconnectSource::new(PeerRef::new("peer1", "Org1MSP"), channel);
        let (_, listener) = counter();
        assert!(matches!(
            source.add_disconnect_listener(listener),
            Err(GatewayError::Registration(_))
        ));
        assert_eq!(source.listener_count(), 0);
    }
}
