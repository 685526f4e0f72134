use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::query::{ClientId, QueryClient};
use crate::store::{Atom, Store, StoreId, WeakStore};

use super::contract::EngineObserver;
use super::subscription::{revision_atom, snapshot_atom};

/// An observer together with the atoms that track it in one store.
pub(crate) struct CachedObserver<O: EngineObserver> {
    pub client: QueryClient,
    pub observer: Arc<O>,
    /// Pushed snapshots, fed while mounted.
    pub snapshots: Atom<O::Result>,
    /// The observer's revision, polled on every read.
    pub revision: Atom<u64>,
}

impl<O: EngineObserver> Clone for CachedObserver<O> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            observer: Arc::clone(&self.observer),
            snapshots: self.snapshots.clone(),
            revision: self.revision.clone(),
        }
    }
}

struct Entry<O: EngineObserver> {
    store: WeakStore,
    cached: CachedObserver<O>,
}

type EntryKey = (StoreId, ClientId);

/// Observers of one cell, one per store and client.
///
/// Entries of dropped stores are swept whenever a new observer is created.
pub(crate) struct ObserverCache<O: EngineObserver> {
    entries: Mutex<HashMap<EntryKey, Entry<O>>>,
}

impl<O: EngineObserver> ObserverCache<O> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the observer for `store` and `client`, creating it or
    /// replacing its options.
    pub fn get_or_create(
        self: &Arc<Self>,
        store: &Store,
        client: &QueryClient,
        options: O::Options,
    ) -> CachedObserver<O> {
        let key = (store.id(), client.id());
        let cached = self.entries.lock().get(&key).map(|entry| entry.cached.clone());
        if let Some(cached) = cached {
            cached.observer.set_options(options);
            return cached;
        }

        let observer = O::create(client, options);
        let cached = CachedObserver {
            client: client.clone(),
            snapshots: snapshot_atom(Arc::downgrade(self), key, &observer),
            revision: revision_atom(&observer),
            observer,
        };
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.store.is_alive());
        // another evaluation may have raced us here; keep the first one
        let cached = entries
            .entry(key)
            .or_insert(Entry {
                store: store.downgrade(),
                cached,
            })
            .cached
            .clone();
        debug!(store = ?key.0, client = ?key.1, "observer cached");
        cached
    }

    /// Observers cached for `store`.
    pub fn observers(&self, store: StoreId) -> Vec<(QueryClient, Arc<O>)> {
        self.entries
            .lock()
            .iter()
            .filter(|((id, _), _)| *id == store)
            .map(|(_, entry)| (entry.cached.client.clone(), Arc::clone(&entry.cached.observer)))
            .collect()
    }

    /// Drops the observer of `store` for `client`; the next read in that
    /// store builds a fresh one.
    pub fn evict(&self, store: StoreId, client: ClientId) -> Option<Arc<O>> {
        let evicted = self
            .entries
            .lock()
            .remove(&(store, client))
            .map(|entry| entry.cached.observer);
        if evicted.is_some() {
            debug!(store = ?store, client = ?client, "observer evicted");
        }
        evicted
    }

    /// `true` while `observer` is the one cached under `key`.
    pub fn is_current(&self, key: EntryKey, observer: &Arc<O>) -> bool {
        self.entries
            .lock()
            .get(&key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.cached.observer, observer))
    }
}

impl<O: EngineObserver> fmt::Debug for ObserverCache<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryObserver, QueryOptions};
    use crate::query_key;

    fn options(key: &str) -> QueryOptions<u32> {
        QueryOptions::new(query_key![key], |_| async { Ok(1) })
    }

    #[test]
    fn test_reuses_observer_per_client() {
        let cache = ObserverCache::<QueryObserver<u32>>::new();
        let store = Store::new();
        let client = QueryClient::new();

        let first = cache.get_or_create(&store, &client, options("a"));
        let second = cache.get_or_create(&store, &client, options("b"));
        assert!(Arc::ptr_eq(&first.observer, &second.observer));
        assert_eq!(second.observer.current_query().hash(), r#"["b"]"#);

        let other = cache.get_or_create(&store, &QueryClient::new(), options("a"));
        assert!(!Arc::ptr_eq(&first.observer, &other.observer));
    }

    #[test]
    fn test_stores_get_their_own_observer() {
        let cache = ObserverCache::<QueryObserver<u32>>::new();
        let (first, second) = (Store::new(), Store::new());
        let client = QueryClient::new();

        let a = cache.get_or_create(&first, &client, options("a"));
        let b = cache.get_or_create(&second, &client, options("b"));
        assert!(!Arc::ptr_eq(&a.observer, &b.observer));
        // options given through one store leave the other's observer alone
        assert_eq!(a.observer.current_query().hash(), r#"["a"]"#);

        assert!(cache.evict(first.id(), client.id()).is_some());
        assert!(cache.is_current((second.id(), client.id()), &b.observer));
        assert_eq!(cache.observers(second.id()).len(), 1);
        assert!(cache.observers(first.id()).is_empty());
    }

    #[test]
    fn test_evict_forgets_observer() {
        let cache = ObserverCache::<QueryObserver<u32>>::new();
        let store = Store::new();
        let client = QueryClient::new();
        let key = (store.id(), client.id());

        let first = cache.get_or_create(&store, &client, options("a"));
        assert!(cache.is_current(key, &first.observer));

        assert!(cache.evict(store.id(), client.id()).is_some());
        assert!(!cache.is_current(key, &first.observer));

        let fresh = cache.get_or_create(&store, &client, options("a"));
        assert!(!Arc::ptr_eq(&first.observer, &fresh.observer));
    }

    #[test]
    fn test_dropped_stores_are_swept() {
        let cache = ObserverCache::<QueryObserver<u32>>::new();
        let client = QueryClient::new();
        let gone = Store::new();
        let gone_id = gone.id();
        cache.get_or_create(&gone, &client, options("a"));
        drop(gone);

        let store = Store::new();
        cache.get_or_create(&store, &client, options("a"));
        assert!(cache.observers(gone_id).is_empty());
        assert_eq!(cache.observers(store.id()).len(), 1);
    }
}
