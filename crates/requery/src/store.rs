use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::config::{CacheConfig, GcPolicy};
use crate::key::QueryKey;

/// A change listener registered for one key.
pub(crate) type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// One cache slot: the atomically replaced snapshot plus the bookkeeping that
/// coordinates fetch attempts for its key.
///
/// The snapshot is replaced wholesale, never mutated in place, so readers can
/// hold on to an `Arc` without ever observing a torn mix of old and new
/// fields.
pub(crate) struct Slot<S, F> {
    /// Current immutable snapshot.
    pub state: Arc<S>,
    /// Id of the most recently started fetch attempt for this slot.
    ///
    /// Results are applied only if their attempt id is still current, which
    /// resolves out-of-order completions in favor of the most recently
    /// initiated attempt.
    pub attempt: u64,
    /// The outstanding attempt, if any. Doubles as the mutual-exclusion
    /// marker: at most one attempt per slot is ever in flight.
    pub in_flight: Option<F>,
    listeners: Vec<(u64, Listener<S>)>,
    /// Bumped on every subscription; a pending eviction fires only if the
    /// epoch it captured is still current.
    gc_epoch: u64,
}

impl<S: Default, F> Slot<S, F> {
    fn idle() -> Self {
        Self {
            state: Arc::new(S::default()),
            attempt: 0,
            in_flight: None,
            listeners: Vec::new(),
            gc_epoch: 0,
        }
    }
}

struct StoreInner<S, F> {
    slots: Mutex<FxHashMap<QueryKey, Slot<S, F>>>,
    attempts: AtomicU64,
    listener_ids: AtomicU64,
    config: CacheConfig,
}

/// Map from canonical key to cache slot, with subscriber fan-out and a
/// configurable gc policy for unsubscribed entries.
///
/// Generic over the snapshot type `S` and the in-flight handle type `F`; the
/// executors layer the fetch semantics on top.
pub(crate) struct CacheStore<S, F> {
    inner: Arc<StoreInner<S, F>>,
}

impl<S, F> Clone for CacheStore<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, F> CacheStore<S, F>
where
    S: Default + Send + Sync + 'static,
    F: Send + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                slots: Mutex::new(FxHashMap::default()),
                attempts: AtomicU64::new(0),
                listener_ids: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Takes the next attempt id.
    ///
    /// The counter is store-wide, so an evicted and re-created slot can never
    /// collide with an attempt from its previous incarnation.
    pub fn next_attempt(&self) -> u64 {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Runs `f` with exclusive access to the slot for `key`, creating it in
    /// idle state first if missing.
    ///
    /// `f` must not run user-supplied code; the store lock is held for its
    /// whole duration.
    pub fn with_slot<R>(&self, key: &QueryKey, f: impl FnOnce(&mut Slot<S, F>) -> R) -> R {
        let mut slots = self.inner.slots.lock().unwrap();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::idle);
        f(slot)
    }

    /// Like [`with_slot`](Self::with_slot), but does not create missing
    /// slots.
    pub fn with_existing_slot<R>(
        &self,
        key: &QueryKey,
        f: impl FnOnce(&mut Slot<S, F>) -> R,
    ) -> Option<R> {
        let mut slots = self.inner.slots.lock().unwrap();
        slots.get_mut(key).map(f)
    }

    /// Read-only, tear-free view of the entry for `key`.
    pub fn snapshot(&self, key: &QueryKey) -> Option<Arc<S>> {
        let slots = self.inner.slots.lock().unwrap();
        slots.get(key).map(|slot| Arc::clone(&slot.state))
    }

    /// Registers a listener for `key`, creating the slot if missing.
    ///
    /// The returned guard unregisters on drop; once the last listener of a
    /// slot is gone the configured [`GcPolicy`] decides the slot's fate.
    pub fn subscribe(&self, key: &QueryKey, listener: Listener<S>) -> Subscription {
        let id = self.inner.listener_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.with_slot(key, |slot| {
            slot.listeners.push((id, listener));
            slot.gc_epoch += 1;
        });

        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        Subscription {
            unsub: Some(Box::new(move || unsubscribe(&inner, &key, id))),
        }
    }

    /// Synchronously delivers the current snapshot to every listener
    /// registered for `key` at call time.
    ///
    /// The listener list and the snapshot are captured under one lock
    /// acquisition and delivered outside of it, so listeners registered
    /// during a delivery do not receive the in-progress notification.
    pub fn notify(&self, key: &QueryKey) {
        let captured = {
            let slots = self.inner.slots.lock().unwrap();
            slots.get(key).map(|slot| {
                let listeners: Vec<_> = slot.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
                (Arc::clone(&slot.state), listeners)
            })
        };
        if let Some((state, listeners)) = captured {
            for listener in listeners {
                listener(state.as_ref());
            }
        }
    }

    /// Drops the slot for `key` outright. Returns whether it existed.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.inner.slots.lock().unwrap().remove(key).is_some()
    }

    /// Drops all slots.
    pub fn clear(&self) {
        self.inner.slots.lock().unwrap().clear();
    }

    /// Number of live slots, subscribed or not.
    pub fn entry_count(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }
}

fn unsubscribe<S, F>(inner: &Arc<StoreInner<S, F>>, key: &QueryKey, id: u64)
where
    S: Send + Sync + 'static,
    F: Send + 'static,
{
    let mut slots = inner.slots.lock().unwrap();
    let Some(slot) = slots.get_mut(key) else {
        return;
    };
    slot.listeners.retain(|(listener_id, _)| *listener_id != id);
    if !slot.listeners.is_empty() {
        return;
    }

    match inner.config.gc {
        GcPolicy::Retain => {}
        GcPolicy::EvictAfter(grace) if grace.is_zero() => {
            tracing::trace!(cache = %inner.config.name, key = %key, "evicting unsubscribed entry");
            slots.remove(key);
        }
        GcPolicy::EvictAfter(grace) => {
            let epoch = slot.gc_epoch;
            drop(slots);

            let task_inner = Arc::clone(inner);
            let task_key = key.clone();
            let evict = async move {
                tokio::time::sleep(grace).await;
                let mut slots = task_inner.slots.lock().unwrap();
                if let Some(slot) = slots.get(&task_key) {
                    if slot.listeners.is_empty() && slot.gc_epoch == epoch {
                        tracing::trace!(
                            cache = %task_inner.config.name,
                            key = %task_key,
                            "evicting unsubscribed entry after grace period",
                        );
                        slots.remove(&task_key);
                    }
                }
            };

            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(evict);
            } else {
                // Without a runtime there is no timer; drop the entry right away.
                inner.slots.lock().unwrap().remove(key);
            }
        }
    }
}

/// An active listener registration. Dropping it unregisters the listener and,
/// for the last listener of a slot, puts the slot under the gc policy.
pub struct Subscription {
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
