//! Block event sources.
//!
//! [`ChannelBlockEventSource`] maps each listener onto one transport
//! subscription. [`OrderedBlockEventSource`] sits on top of any source and
//! turns an out-of-order, at-least-once feed into a gap-free, duplicate-free,
//! strictly increasing one.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::Stream;

use crate::error::GatewayError;
use crate::listener::BlockListener;
use crate::registry::{lock, ListenerId, ListenerRegistry};
use crate::transport::{ChannelTransport, TransportHandle};
use crate::types::BlockEvent;

/// A source of block events.
pub trait BlockEventSource: Send + Sync {
    /// Register a listener. Re-adding a registered listener returns its handle.
    fn add_block_listener(&self, listener: Arc<dyn BlockListener>) -> Result<ListenerId, GatewayError>;

    /// No-op for unknown handles.
    fn remove_block_listener(&self, id: ListenerId);

    /// Remove every listener and release upstream resources. Never fails.
    fn close(&self);
}

// ─── Channel source ───────────────────────────────────────────────────────────

struct BlockSubscription {
    handle: TransportHandle,
    active: Arc<AtomicBool>,
}

/// Block source backed directly by the channel transport. Delivery order and
/// multiplicity are whatever the transport provides.
pub struct ChannelBlockEventSource {
    transport: Arc<dyn ChannelTransport>,
    start_block: Option<u64>,
    listeners: ListenerRegistry<dyn BlockListener, BlockSubscription>,
}

impl ChannelBlockEventSource {
    /// Live blocks only.
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self::from_block(transport, None)
    }

    /// Replay from `start_block` (when given) before switching to live blocks.
    pub fn from_block(transport: Arc<dyn ChannelTransport>, start_block: Option<u64>) -> Self {
        Self {
            transport,
            start_block,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn subscribe(&self, listener: &Arc<dyn BlockListener>) -> Result<BlockSubscription, GatewayError> {
        let active = Arc::new(AtomicBool::new(true));
        let (flag, target) = (active.clone(), listener.clone());
        let handle = self.transport.register_block_listener(
            self.start_block,
            Arc::new(move |block: &Arc<BlockEvent>| {
                if flag.load(Ordering::SeqCst) {
                    target.received_block(block);
                }
            }),
        )?;
        Ok(BlockSubscription { handle, active })
    }

    fn release(&self, subscription: BlockSubscription) {
        subscription.active.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.unregister_block_listener(&subscription.handle) {
            tracing::warn!(handle = %subscription.handle, error = %e, "Ignoring block listener unregister failure");
        }
    }
}

impl BlockEventSource for ChannelBlockEventSource {
    fn add_block_listener(&self, listener: Arc<dyn BlockListener>) -> Result<ListenerId, GatewayError> {
        self.listeners
            .add_with(listener, |listener| self.subscribe(listener), |surplus| self.release(surplus))
    }

    fn remove_block_listener(&self, id: ListenerId) {
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

// ─── Ordered source ───────────────────────────────────────────────────────────

#[derive(Default)]
struct OrderState {
    /// First block number to deliver, when known up front.
    origin: Option<u64>,
    last_delivered: Option<u64>,
    queued: BTreeMap<u64, Arc<BlockEvent>>,
}

impl OrderState {
    fn is_stale(&self, number: u64) -> bool {
        match (self.last_delivered, self.origin) {
            (Some(last), _) => number <= last,
            (None, Some(origin)) => number < origin,
            (None, None) => false,
        }
    }

    fn is_next(&self, number: u64) -> bool {
        match (self.last_delivered, self.origin) {
            (Some(last), _) => last.checked_add(1) == Some(number),
            (None, Some(origin)) => number == origin,
            (None, None) => true,
        }
    }

    /// Take the lowest queued block if it is the next one due.
    fn pop_next(&mut self) -> Option<Arc<BlockEvent>> {
        let next = self.queued.keys().next().copied()?;
        if !self.is_next(next) {
            tracing::debug!(block = next, queued = self.queued.len(), "Waiting for missing block");
            return None;
        }
        let block = self.queued.remove(&next)?;
        self.last_delivered = Some(next);
        Some(block)
    }
}

struct OrderedInner {
    listeners: ListenerRegistry<dyn BlockListener>,
    state: Mutex<OrderState>,
    /// Held for a whole delivery round so listeners see blocks one at a
    /// time and in order. `state` is never held while listeners run.
    delivery: Mutex<()>,
}

impl OrderedInner {
    fn received_block(&self, block: &Arc<BlockEvent>) {
        let _delivery = lock(&self.delivery);
        {
            let mut state = lock(&self.state);
            let number = block.block_number;
            if state.is_stale(number) {
                tracing::debug!(block = number, last = ?state.last_delivered, "Discarding stale block");
                return;
            }
            state.queued.entry(number).or_insert_with(|| block.clone());
        }

        loop {
            let next = lock(&self.state).pop_next();
            let Some(block) = next else {
                break;
            };
            self.listeners.for_each(|listener| listener.received_block(&block));
        }
    }
}

/// Delivers blocks to its listeners in strictly increasing order with no
/// gaps or duplicates.
///
/// Unless built with [`starting_at`](Self::starting_at), the first block
/// delivered establishes the starting point. Blocks at or below the last
/// delivered number are dropped; blocks beyond the next expected number are
/// buffered until the gap fills. The ordered source attaches to its upstream
/// when its first listener is added.
pub struct OrderedBlockEventSource {
    upstream: Arc<dyn BlockEventSource>,
    inner: Arc<OrderedInner>,
    attachment: Mutex<Option<ListenerId>>,
}

impl OrderedBlockEventSource {
    pub fn new(upstream: Arc<dyn BlockEventSource>) -> Self {
        Self::with_state(upstream, OrderState::default())
    }

    /// Deliver from block `start` onwards, buffering anything later until
    /// `start` itself arrives.
    pub fn starting_at(upstream: Arc<dyn BlockEventSource>, start: u64) -> Self {
        Self::with_state(
            upstream,
            OrderState {
                origin: Some(start),
                ..OrderState::default()
            },
        )
    }

    fn with_state(upstream: Arc<dyn BlockEventSource>, state: OrderState) -> Self {
        Self {
            upstream,
            inner: Arc::new(OrderedInner {
                listeners: ListenerRegistry::new(),
                state: Mutex::new(state),
                delivery: Mutex::new(()),
            }),
            attachment: Mutex::new(None),
        }
    }

    /// Number of the last block delivered to listeners.
    pub fn last_delivered(&self) -> Option<u64> {
        lock(&self.inner.state).last_delivered
    }

    /// Number of blocks buffered while waiting for a gap to fill.
    pub fn queued(&self) -> usize {
        lock(&self.inner.state).queued.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Deliver an upstream block. Normally called by the upstream subscription.
    pub fn received_block(&self, block: &Arc<BlockEvent>) {
        self.inner.received_block(block);
    }

    /// Ordered blocks as an async stream. Dropping the stream unregisters it.
    pub fn stream(&self) -> Result<BlockStream, GatewayError> {
        let (tx, rx) = mpsc::unbounded();
        let id = self.add_block_listener(Arc::new(move |block: &Arc<BlockEvent>| {
            let _ = tx.unbounded_send(block.clone());
        }))?;
        Ok(BlockStream {
            receiver: rx,
            source: Arc::downgrade(&self.inner),
            id,
        })
    }

    fn attach(&self) -> Result<(), GatewayError> {
        let mut attachment = lock(&self.attachment);
        if attachment.is_some() {
            return Ok(());
        }
        let inner: Weak<OrderedInner> = Arc::downgrade(&self.inner);
        let id = self.upstream.add_block_listener(Arc::new(move |block: &Arc<BlockEvent>| {
            if let Some(inner) = inner.upgrade() {
                inner.received_block(block);
            }
        }))?;
        *attachment = Some(id);
        Ok(())
    }
}

impl BlockEventSource for OrderedBlockEventSource {
    fn add_block_listener(&self, listener: Arc<dyn BlockListener>) -> Result<ListenerId, GatewayError> {
        let id = self.inner.listeners.add(listener);
        if let Err(e) = self.attach() {
            self.inner.listeners.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    fn remove_block_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(id);
    }

    fn close(&self) {
        self.inner.listeners.drain();
        let attached = lock(&self.attachment).take();
        if let Some(id) = attached {
            self.upstream.remove_block_listener(id);
        }
    }
}

/// Stream of ordered blocks returned by [`OrderedBlockEventSource::stream`].
pub struct BlockStream {
    receiver: mpsc::UnboundedReceiver<Arc<BlockEvent>>,
    source: Weak<OrderedInner>,
    id: ListenerId,
}

impl Stream for BlockStream {
    type Item = Arc<BlockEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.listeners.remove(self.id);
        }
    }
}
