//! Typed synchronous pub/sub used for push notifications.
//!
//! Queries notify their observers, observers notify their subscribers and the
//! mutation cache notifies its watchers through an [`Emitter`].
//!
//! Emission works on a snapshot of the listener list:
//!   - a listener removed during emission is still called in that round;
//!   - a listener added during emission is not called until the next emit.
//!
//! The internal lock is never held while a listener runs, so listeners may
//! subscribe or unsubscribe from inside a callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Identifies a listener registered with [`Emitter::on`].
pub type ListenerId = u64;

/// Closure type for listeners.
pub type Listener<T> = dyn Fn(&T) + Send + Sync;

pub struct Emitter<T> {
    listeners: Mutex<Vec<(ListenerId, Arc<Listener<T>>)>>,
    next_id: AtomicU64,
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `callback` and returns its id.
    pub fn on(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Removes the listener `id`. Returns `true` if it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Calls every registered listener with `event`.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Arc<Listener<T>>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.len())
            .finish()
    }
}
