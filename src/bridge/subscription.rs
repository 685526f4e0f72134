use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::query::ClientId;
use crate::store::{Atom, AtomSetter, OnUnmount, StoreId};

use super::contract::EngineObserver;
use super::observer_cache::ObserverCache;

/// Atom fed by an observer's pushed snapshots while it is mounted.
///
/// Mounting subscribes to the observer and resynchronises with its current
/// result; unmounting unsubscribes. Pushes from an observer that is no longer
/// the one cached under `key` are dropped. Snapshots pushed while the store is
/// evaluating are queued by the store and applied once it is idle.
pub(crate) fn snapshot_atom<O: EngineObserver>(
    cache: Weak<ObserverCache<O>>,
    key: (StoreId, ClientId),
    observer: &Arc<O>,
) -> Atom<O::Result> {
    let (store, client) = key;
    let observer_ref = Arc::downgrade(observer);
    Atom::with_on_mount(observer.current_result(), move |setter: AtomSetter<O::Result>| {
        let observer = observer_ref.upgrade()?;
        let listener = observer.subscribe(Box::new({
            let cache = cache.clone();
            let observer_ref = observer_ref.clone();
            let setter = setter.clone();
            move |result: &O::Result| {
                let current = match (cache.upgrade(), observer_ref.upgrade()) {
                    (Some(cache), Some(observer)) => cache.is_current(key, &observer),
                    _ => false,
                };
                if current {
                    setter.set(result.clone());
                } else {
                    trace!(store = ?store, client = ?client, "dropping snapshot of a replaced observer");
                }
            }
        }));
        debug!(store = ?store, client = ?client, "observer subscription mounted");
        setter.set(observer.current_result());

        let observer_ref = observer_ref.clone();
        Some(Box::new(move || {
            if let Some(observer) = observer_ref.upgrade() {
                observer.unsubscribe(listener);
            }
            debug!(store = ?store, client = ?client, "observer subscription unmounted");
        }) as OnUnmount)
    })
    .with_label("snapshots")
}

/// Atom mirroring the observer's revision.
///
/// Lets an unmounted read notice that the query changed since the cell was
/// last computed.
pub(crate) fn revision_atom<O: EngineObserver>(observer: &Arc<O>) -> Atom<u64> {
    let observer = Arc::downgrade(observer);
    Atom::versioned(move || observer.upgrade().map_or(0, |observer| observer.revision()))
        .with_label("revision")
}
