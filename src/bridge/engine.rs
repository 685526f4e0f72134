//! The binding engine shared by every variant.
//!
//! A variant is an [`EngineObserver`] kind plus a [`VariantPolicy`]. The
//! engine turns them into atoms:
//!
//! ```text
//! refresh ─┐                ┌▶ snapshots (mounted: subscribed to the observer)
//! client ──┼─▶ binding ─────┤
//! options ─┘      │         └▶ revision (polled on every read)
//!                 ▼                 │
//!   lifecycle ─▶ cell = project(observer, options, is_restoring)
//! ```
//!
//! `binding` resolves the options and fetches the store's observer for the
//! cell from its [`ObserverCache`], replacing the options of an existing one.
//! `revision` lets a read outside of any subscription see cache writes made
//! since the last one. `lifecycle` is mounted with the cell and owns the
//! unmount policy.

use std::fmt;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::emitter::ListenerId;
use crate::error::AtomError;
use crate::query::{
    MutateOptions, MutationObserver, MutationObserverResult, MutationOptions, Query, QueryClient,
    QueryFilters,
};
use crate::store::{
    Atom, AtomSetter, Getter, OnUnmount, Setter, Store, StoreId, Suspense, WritableAtom,
};

use super::action::{MutateFuture, RefetchFuture};
use super::client::{ClientAccessor, is_restoring_atom};
use super::contract::{EngineObserver, EngineQueryObserver, settle};
use super::observer_cache::ObserverCache;
use super::projector::project;
use super::reset_boundary::error_reset_atom;
use super::resolver::{OptionsFn, VariantPolicy, resolve_options};

/// The observer a cell is bound to for the current client and options.
pub(crate) struct Binding<O: EngineObserver> {
    pub client: QueryClient,
    pub observer: Arc<O>,
    pub snapshots: Atom<O::Result>,
    pub revision: Atom<u64>,
    pub options: O::Options,
}

impl<O: EngineObserver> Clone for Binding<O> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            observer: Arc::clone(&self.observer),
            snapshots: self.snapshots.clone(),
            revision: self.revision.clone(),
            options: self.options.clone(),
        }
    }
}

impl<O: EngineObserver> fmt::Debug for Binding<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("client", &self.client.id())
            .finish_non_exhaustive()
    }
}

/// Builds the binding atom of a cell.
///
/// Reading `refresh` makes a bump of it rebuild the binding, which picks up a
/// freshly created observer after an eviction.
pub(crate) fn binding_atom<O, F>(
    cache: Arc<ObserverCache<O>>,
    refresh: Atom<u64>,
    client: ClientAccessor,
    options: F,
) -> Atom<Binding<O>>
where
    O: EngineObserver,
    F: Fn(&Getter<'_>) -> Result<O::Options, AtomError> + Send + Sync + 'static,
{
    Atom::derived(move |get| {
        get.get(&refresh)?;
        let client = client(get)?;
        let options = options(get)?;
        let cached = cache.get_or_create(get.store(), &client, options.clone());
        Ok(Binding {
            client,
            observer: cached.observer,
            snapshots: cached.snapshots,
            revision: cached.revision,
            options,
        })
    })
    .with_label("binding")
}

/// Atoms of one query cell.
pub(crate) struct QueryEngine<O: EngineQueryObserver> {
    pub cache: Arc<ObserverCache<O>>,
    pub refresh: Atom<u64>,
    pub binding: Atom<Binding<O>>,
    pub lifecycle: Atom<()>,
}

impl<O: EngineQueryObserver> Clone for QueryEngine<O> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            refresh: self.refresh.clone(),
            binding: self.binding.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<O: EngineQueryObserver> QueryEngine<O> {
    pub fn new(options: OptionsFn<O::Options>, client: ClientAccessor, policy: VariantPolicy) -> Self {
        let cache = ObserverCache::<O>::new();
        let refresh = Atom::new(0_u64).with_label("refresh");
        let binding = binding_atom(Arc::clone(&cache), refresh.clone(), client, move |get| {
            let is_reset = get.get(&error_reset_atom())?;
            let mut options = options(get)?;
            resolve_options(O::query_options_mut(&mut options), policy, is_reset);
            Ok(options)
        });
        let lifecycle = {
            let cache = Arc::clone(&cache);
            Atom::with_on_mount((), move |setter: AtomSetter<()>| {
                let store = setter.store();
                if store.get(&error_reset_atom()).unwrap_or(false) {
                    store.set(&error_reset_atom(), false);
                }
                let cache = Arc::clone(&cache);
                let store = store.id();
                Some(Box::new(move || heal_errored(&cache, store)) as OnUnmount)
            })
            .with_label("lifecycle")
        };
        Self {
            cache,
            refresh,
            binding,
            lifecycle,
        }
    }

    /// The cell: the projected result, writable with the observer's actions.
    pub fn cell(&self) -> WritableAtom<O::Result, O::Action, RefetchFuture<O::Result>> {
        let read = {
            let lifecycle = self.lifecycle.clone();
            let binding = self.binding.clone();
            Atom::derived(move |get| {
                get.get(&lifecycle)?;
                let binding = get.get(&binding)?;
                get.get(&binding.snapshots)?;
                get.get(&binding.revision)?;
                let is_restoring = get.get(&is_restoring_atom())?;
                project(&binding.observer, &binding.options, is_restoring)
            })
        };
        let engine = self.clone();
        read.writable(move |set: &Setter<'_>, action: O::Action| engine.dispatch(set.store(), action))
    }

    /// Runs `action` against the bound observer.
    ///
    /// A force refetch evicts the store's observer and removes its query, then
    /// bumps `refresh` so the next read starts over. Anything else goes to the
    /// observer and resolves with its settled snapshot; a failure is an error
    /// unless the action's refetch options say otherwise.
    pub fn dispatch(&self, store: &Store, action: O::Action) -> RefetchFuture<O::Result> {
        match store.get(&self.binding) {
            Ok(binding) => self.dispatch_bound(store, binding, action),
            Err(AtomError::Query(error)) => future::ready(Err(error)).boxed(),
            Err(AtomError::Suspended(_)) => {
                let engine = self.clone();
                let store = store.clone();
                async move {
                    let binding = store.get_async(&engine.binding).await?;
                    engine.dispatch_bound(&store, binding, action).await
                }
                .boxed()
            }
        }
    }

    fn dispatch_bound(&self, store: &Store, binding: Binding<O>, action: O::Action) -> RefetchFuture<O::Result> {
        if O::is_force(&action) {
            debug!(store = ?store.id(), client = ?binding.client.id(), "force refetch");
            self.cache.evict(store.id(), binding.client.id());
            binding.observer.remove();
            let generation = store.get(&self.refresh).unwrap_or(0);
            store.set(&self.refresh, generation + 1);
            // the old binding's atoms are unreachable now
            drop(binding);
            store.prune();
            return future::ready(Ok(None)).boxed();
        }
        let throw_on_error = O::refetch_options(&action).throw_on_error;
        settle::<O>(binding.observer.dispatch(action), throw_on_error)
            .map(|result| result.map(Some))
            .boxed()
    }

    /// Suspension for a read that waits for data in `result`: the fetch
    /// when one is running or about to start, otherwise the next change of
    /// the query.
    pub fn wait_for_data(binding: &Binding<O>, result: &O::Result) -> Suspense {
        if O::snapshot(result).is_fetching() {
            // joins a running fetch instead of starting another one
            let fetch = binding.observer.fetch_optimistic(&binding.options);
            Suspense::new(fetch.map(|_| ()))
        } else {
            next_change(&binding.observer.current_query())
        }
    }
}

impl<O: EngineQueryObserver> fmt::Debug for QueryEngine<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("cache", &self.cache)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

/// Resets the queries of cached observers whose result is an error, so the
/// next mount starts clean instead of showing the error again.
fn heal_errored<O: EngineQueryObserver>(cache: &ObserverCache<O>, store: StoreId) {
    for (client, observer) in cache.observers(store) {
        if !O::snapshot(&observer.current_result()).is_error() {
            continue;
        }
        let query = observer.current_query();
        debug!(query = %query.hash(), "resetting errored query on unmount");
        // only reset; nothing is mounted to show a refetch
        drop(client.reset_queries(QueryFilters::key(query.key().clone()).exact()));
    }
}

/// Settles on the next change of `query`.
///
/// The listener removes itself when it fires. If the query is dropped first,
/// the suspension settles as well.
pub(crate) fn next_change<T>(query: &Arc<Query<T>>) -> Suspense
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    let slot: Arc<OnceLock<ListenerId>> = Arc::default();
    let listener = query.subscribe({
        let slot = Arc::clone(&slot);
        let query = Arc::downgrade(query);
        move |_| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
            if let (Some(id), Some(query)) = (slot.get(), query.upgrade()) {
                query.unsubscribe(*id);
            }
        }
    });
    let _ = slot.set(listener);
    Suspense::new(async move {
        let _ = rx.await;
    })
}

/// Settles on the next snapshot `observer` pushes.
pub(crate) fn next_push<O: EngineObserver>(observer: &Arc<O>) -> Suspense {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Mutex::new(Some(tx));
    let slot: Arc<OnceLock<ListenerId>> = Arc::default();
    let listener = observer.subscribe(Box::new({
        let slot = Arc::clone(&slot);
        let observer = Arc::downgrade(observer);
        move |_: &O::Result| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
            if let (Some(id), Some(observer)) = (slot.get(), observer.upgrade()) {
                observer.unsubscribe(*id);
            }
        }
    }));
    let _ = slot.set(listener);
    Suspense::new(async move {
        let _ = rx.await;
    })
}

/// Atoms of one mutation cell.
///
/// Unmounting the cell resets its observers, so a remount starts idle.
pub(crate) struct MutationEngine<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub binding: Atom<Binding<MutationObserver<T, V>>>,
    pub lifecycle: Atom<()>,
}

impl<T, V> Clone for MutationEngine<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<T, V> MutationEngine<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: OptionsFn<MutationOptions<T, V>>, client: ClientAccessor) -> Self {
        let cache = ObserverCache::<MutationObserver<T, V>>::new();
        let refresh = Atom::new(0_u64).with_label("refresh");
        let binding = binding_atom(Arc::clone(&cache), refresh, client, move |get| options(get));
        let lifecycle = Atom::with_on_mount((), move |setter: AtomSetter<()>| {
            let cache = Arc::clone(&cache);
            let store = setter.store().id();
            Some(Box::new(move || {
                for (_, observer) in cache.observers(store) {
                    trace!("resetting mutation on unmount");
                    observer.reset();
                }
            }) as OnUnmount)
        })
        .with_label("lifecycle");
        Self { binding, lifecycle }
    }

    /// Reads the bound observer and its result, mounting the subscription.
    pub fn read(
        &self,
        get: &Getter<'_>,
    ) -> Result<(Binding<MutationObserver<T, V>>, MutationObserverResult<T, V>), AtomError> {
        get.get(&self.lifecycle)?;
        let binding = get.get(&self.binding)?;
        get.get(&binding.snapshots)?;
        get.get(&binding.revision)?;
        let result = binding.observer.current_result();
        Ok((binding, result))
    }

    /// Runs a mutation. Failures are logged and only surface in the result.
    ///
    /// The mutation starts right away when the observer is available; the
    /// returned future only reports its data.
    pub fn mutate(&self, store: &Store, variables: V, options: MutateOptions<T, V>) -> MutateFuture<T> {
        let running = match store.get(&self.binding) {
            Ok(binding) => binding.observer.mutate(variables, options),
            Err(AtomError::Query(error)) => {
                warn!(%error, "mutation could not start");
                return future::ready(None).boxed();
            }
            Err(AtomError::Suspended(_)) => {
                let engine = self.clone();
                let store = store.clone();
                async move {
                    let binding = store.get_async(&engine.binding).await?;
                    binding.observer.mutate(variables, options).await
                }
                .boxed()
            }
        };
        running
            .map(|result| match result {
                Ok(data) => Some(data),
                Err(error) => {
                    warn!(%error, "mutation failed");
                    None
                }
            })
            .boxed()
    }
}
