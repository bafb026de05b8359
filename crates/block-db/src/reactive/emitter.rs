//! Emitter<T>: the callback list behind a live subscription.
//!
//! Callbacks are stored as `Arc<dyn Fn(&T)>` and snapshotted before each
//! emission, so a callback removed while an emission is running still sees
//! that round, and one added during it waits for the next. The internal lock
//! is never held while callbacks run; callbacks may subscribe or unsubscribe.
//! A panicking callback is logged and does not stop delivery to the rest.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identifies one registered callback.
pub type ListenerId = u64;

pub type ListenerFn<T> = dyn Fn(&T) + Send + Sync;

pub struct Emitter<T> {
    listeners: Mutex<Vec<(ListenerId, Arc<ListenerFn<T>>)>>,
    next_id: AtomicU64,
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        self.on_shared(Arc::new(callback))
    }

    pub fn on_shared(&self, callback: Arc<ListenerFn<T>>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, callback));
        id
    }

    /// Remove a callback. Returns the number of callbacks left.
    pub fn off(&self, id: ListenerId) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len()
    }

    /// Call every registered callback with `event`.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Arc<ListenerFn<T>>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            invoke(&cb, event);
        }
    }

    /// Call only the callback registered as `id`, if it is still present.
    pub fn emit_to(&self, id: ListenerId, event: &T) {
        let target = self
            .listeners
            .lock()
            .iter()
            .find(|(lid, _)| *lid == id)
            .map(|(_, cb)| Arc::clone(cb));
        if let Some(cb) = target {
            invoke(&cb, event);
        }
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.lock().iter().any(|(lid, _)| *lid == id)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn invoke<T>(cb: &Arc<ListenerFn<T>>, event: &T) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
        tracing::error!("listener callback panicked");
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
