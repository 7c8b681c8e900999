// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Listener registry with unsubscribe handles.
//!
//! Listeners run synchronously on the notifying task. A listener that panics is
//! logged and skipped; the remaining listeners are still notified.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Fan-out registry of listeners for values of type `T`.
pub struct ObserverRegistry<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for ObserverRegistry<T> {
    fn clone(&self) -> Self {
        ObserverRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> ObserverRegistry<T> {
    pub fn new() -> Self {
        ObserverRegistry {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = self.inner.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Invoke every registered listener with `value`.
    pub fn notify(&self, value: &T) {
        // Snapshot so listeners may subscribe or unsubscribe while running
        let listeners: Vec<Listener<T>> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            invoke_isolated(|| listener(value));
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A value whose changes reach listeners in order.
///
/// One caller delivers at a time. An update made while a delivery is running,
/// from another thread or from inside a listener, is handed over to that
/// delivery, which keeps going until every listener has seen the newest
/// version. Listeners may skip intermediate values but never observe an older
/// value after a newer one.
pub struct ObservedState<T> {
    inner: Arc<ObservedInner<T>>,
}

struct ObservedInner<T> {
    /// Current value and its version; the version bumps on every change.
    value: Mutex<(T, u64)>,
    slots: Mutex<Slots<T>>,
    delivery: Mutex<DeliveryFlags>,
}

struct Slots<T> {
    next_id: u64,
    slots: Vec<Slot<T>>,
}

struct Slot<T> {
    id: u64,
    listener: Listener<T>,
    /// Last version handed to this listener.
    seen: Option<u64>,
}

#[derive(Default)]
struct DeliveryFlags {
    active: bool,
    dirty: bool,
}

impl<T> Clone for ObservedState<T> {
    fn clone(&self) -> Self {
        ObservedState {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> ObservedState<T> {
    pub fn new(initial: T) -> Self {
        ObservedState {
            inner: Arc::new(ObservedInner {
                value: Mutex::new((initial, 0)),
                slots: Mutex::new(Slots {
                    next_id: 0,
                    slots: Vec::new(),
                }),
                delivery: Mutex::new(DeliveryFlags::default()),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.lock().0.clone()
    }

    /// Apply `update` and notify listeners if the value changed. Returns
    /// whether it changed.
    pub fn update(&self, update: impl FnOnce(&mut T)) -> bool {
        let changed = {
            let mut current = self.inner.value.lock();
            let before = current.0.clone();
            update(&mut current.0);
            if current.0 == before {
                false
            } else {
                current.1 += 1;
                true
            }
        };
        if changed {
            self.deliver();
        }
        changed
    }

    pub fn set(&self, value: T) -> bool {
        self.update(|current| *current = value)
    }

    /// Register a listener for future changes.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.register(Arc::new(listener), false)
    }

    /// Register a listener and hand it the current value first.
    pub fn subscribe_current(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.register(Arc::new(listener), true)
    }

    fn register(&self, listener: Listener<T>, current: bool) -> Subscription {
        let id = {
            let mut slots = self.inner.slots.lock();
            let seen = if current {
                None
            } else {
                Some(self.inner.value.lock().1)
            };
            slots.next_id += 1;
            let id = slots.next_id;
            slots.slots.push(Slot { id, listener, seen });
            id
        };
        if current {
            self.deliver();
        }

        let weak: Weak<ObservedInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.slots.lock().slots.retain(|slot| slot.id != id);
            }
        })
    }

    fn deliver(&self) {
        {
            let mut flags = self.inner.delivery.lock();
            if flags.active {
                flags.dirty = true;
                return;
            }
            flags.active = true;
        }

        loop {
            let (value, version) = self.inner.value.lock().clone();
            let due: Vec<Listener<T>> = self
                .inner
                .slots
                .lock()
                .slots
                .iter_mut()
                .filter(|slot| slot.seen.is_none_or(|seen| seen < version))
                .map(|slot| {
                    slot.seen = Some(version);
                    Arc::clone(&slot.listener)
                })
                .collect();

            for listener in due {
                invoke_isolated(|| listener(&value));
            }

            let mut flags = self.inner.delivery.lock();
            if flags.dirty {
                flags.dirty = false;
                continue;
            }
            flags.active = false;
            return;
        }
    }
}

/// Run a listener, containing any panic it raises.
pub(crate) fn invoke_isolated(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("listener panicked; continuing with remaining listeners");
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "observer_tests.rs"]
mod tests;
