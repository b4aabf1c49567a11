//! Thread-safe listener registry.
//!
//! Maps each listener (by identity of its `Arc` allocation) to at most one
//! active subscription value `S`. Dispatch runs over a point-in-time snapshot,
//! so listeners may add or remove listeners from inside their own callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a listener panicked while it was held.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying a registration. Pass it back to remove the listener.
///
/// Handles are unique across every registry in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct Entry<L: ?Sized, S> {
    id: ListenerId,
    listener: Arc<L>,
    subscription: S,
}

/// Registry of listeners, each paired with its subscription state.
pub struct ListenerRegistry<L: ?Sized, S = ()> {
    entries: Mutex<Vec<Entry<L, S>>>,
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<L: ?Sized, S> ListenerRegistry<L, S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Handle of `listener` if it is currently registered.
    pub fn find(&self, listener: &Arc<L>) -> Option<ListenerId> {
        lock(&self.entries)
            .iter()
            .find(|e| same_listener(&e.listener, listener))
            .map(|e| e.id)
    }

    /// Register `listener`, creating its subscription with `subscribe`.
    ///
    /// If the listener is already registered its existing handle is returned
    /// and `subscribe` is not called. `subscribe` runs outside the registry
    /// lock; if a concurrent call registered the same listener in the
    /// meantime, the surplus subscription is handed to `release`.
    pub fn add_with<E>(
        &self,
        listener: Arc<L>,
        subscribe: impl FnOnce(&Arc<L>) -> Result<S, E>,
        release: impl FnOnce(S),
    ) -> Result<ListenerId, E> {
        if let Some(id) = self.find(&listener) {
            return Ok(id);
        }

        let subscription = subscribe(&listener)?;

        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.iter().find(|e| same_listener(&e.listener, &listener)) {
            let id = existing.id;
            drop(entries);
            release(subscription);
            return Ok(id);
        }
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        entries.push(Entry {
            id,
            listener,
            subscription,
        });
        Ok(id)
    }

    /// Remove a registration, returning its subscription. No-op for unknown handles.
    pub fn remove(&self, id: ListenerId) -> Option<S> {
        let mut entries = lock(&self.entries);
        let index = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(index).subscription)
    }

    /// Remove every registration, returning the subscriptions for teardown.
    pub fn drain(&self) -> Vec<(ListenerId, S)> {
        lock(&self.entries)
            .drain(..)
            .map(|e| (e.id, e.subscription))
            .collect()
    }

    /// Run `f` against the subscription for `id` while the registry is locked.
    pub fn with_subscription<R>(&self, id: ListenerId, f: impl FnOnce(&S) -> R) -> Option<R> {
        lock(&self.entries)
            .iter()
            .find(|e| e.id == id)
            .map(|e| f(&e.subscription))
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        lock(&self.entries).iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the registered listeners.
    pub fn snapshot(&self) -> Vec<(ListenerId, Arc<L>)> {
        lock(&self.entries)
            .iter()
            .map(|e| (e.id, e.listener.clone()))
            .collect()
    }

    /// Invoke `f` for every listener registered at the start of the round.
    ///
    /// A listener removed earlier in the same round is skipped. No lock is held
    /// while `f` runs.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        for (id, listener) in self.snapshot() {
            if self.contains(id) {
                f(&*listener);
            }
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L, ()> {
    /// Register a listener that needs no subscription state. Idempotent.
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        match self.add_with(listener, |_| Ok::<(), std::convert::Infallible>(()), |_| {}) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl<L: ?Sized, S> Default for ListenerRegistry<L, S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    type Callback = dyn Fn(u32) + Send + Sync;

    #[test]
    fn add_is_idempotent() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let listener: Arc<Callback> = Arc::new(move |n: u32| {
            c.fetch_add(n, Ordering::Relaxed);
        });

        let first = registry.add(listener.clone());
        let second = registry.add(listener.clone());
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);

        registry.for_each(|l| l(1));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let id = registry.add(Arc::new(|_: u32| {}));
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn distinct_closures_get_distinct_handles() {
        let registry: ListenerRegistry<Callback> = ListenerRegistry::new();
        let a = registry.add(Arc::new(|_: u32| {}));
        let b = registry.add(Arc::new(|_: u32| {}));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn subscribe_failure_registers_nothing() {
        let registry: ListenerRegistry<Callback, String> = ListenerRegistry::new();
        let result = registry.add_with(Arc::new(|_: u32| {}), |_| Err("refused"), |_| {});
        assert_eq!(result, Err("refused"));
        assert!(registry.is_empty());
    }

    #[test]
    fn subscription_is_returned_on_remove() {
        let registry: ListenerRegistry<Callback, String> = ListenerRegistry::new();
        let id = registry
            .add_with(Arc::new(|_: u32| {}), |_| Ok::<_, ()>("handle-1".to_string()), |_| {})
            .unwrap();
        assert_eq!(registry.remove(id).as_deref(), Some("handle-1"));
    }

    #[test]
    fn listener_removed_mid_round_is_skipped() {
        let registry: Arc<ListenerRegistry<Callback>> = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));

        // second listener is registered after the first; first removes it
        let victim_id = Arc::new(Mutex::new(None::<ListenerId>));
        let (r, v) = (registry.clone(), victim_id.clone());
        registry.add(Arc::new(move |_: u32| {
            if let Some(id) = *lock(&v) {
                r.remove(id);
            }
        }));
        let c = calls.clone();
        let id = registry.add(Arc::new(move |_: u32| {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        *lock(&victim_id) = Some(id);

        registry.for_each(|l| l(0));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn self_removal_during_dispatch() {
        let registry: Arc<ListenerRegistry<Callback>> = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));

        let (r, me, c) = (registry.clone(), own_id.clone(), calls.clone());
        let id = registry.add(Arc::new(move |_: u32| {
            c.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = *lock(&me) {
                r.remove(id);
            }
        }));
        *lock(&own_id) = Some(id);
        let other_calls = Arc::new(AtomicU32::new(0));
        let oc = other_calls.clone();
        registry.add(Arc::new(move |_: u32| {
            oc.fetch_add(1, Ordering::Relaxed);
        }));

        registry.for_each(|l| l(0));
        registry.for_each(|l| l(0));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(other_calls.load(Ordering::Relaxed), 2);
    }
}
