use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::bridge::{ClientAccessor, MutationEngine, resolve_client};
use crate::error::{AtomError, QueryError};
use crate::query::{
    ClientId, MutateOptions, MutationFilters, MutationObserver, MutationObserverResult,
    MutationOptions, MutationState, MutationStatus, QueryClient,
};
use crate::store::{Atom, AtomSetter, Getter, OnUnmount};

/// What a mutation cell reads: the latest mutation's result and the means to
/// start another one.
pub struct MutationAtomResult<T, V> {
    pub result: MutationObserverResult<T, V>,
    observer: Arc<MutationObserver<T, V>>,
}

impl<T, V> MutationAtomResult<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts a mutation without waiting for it.
    ///
    /// A failure is logged and otherwise only visible in the cell's result.
    pub fn mutate(&self, variables: V) {
        self.mutate_with(variables, MutateOptions::new());
    }

    /// Like [`mutate`](Self::mutate), with callbacks.
    pub fn mutate_with(&self, variables: V, options: MutateOptions<T, V>) {
        let running = self.observer.mutate(variables, options);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = running.await {
                        warn!(%error, "mutation failed");
                    }
                });
            }
            Err(_) => warn!("mutation started outside of a Tokio runtime was dropped"),
        }
    }

    /// Starts a mutation and resolves with its outcome.
    pub fn mutate_async(
        &self,
        variables: V,
        options: MutateOptions<T, V>,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        self.observer.mutate(variables, options)
    }

    /// Forgets the latest mutation; the cell reads idle again.
    pub fn reset(&self) {
        self.observer.reset();
    }
}

impl<T, V> Deref for MutationAtomResult<T, V> {
    type Target = MutationObserverResult<T, V>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

impl<T: Clone, V: Clone> Clone for MutationAtomResult<T, V> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<T: fmt::Debug, V: fmt::Debug> fmt::Debug for MutationAtomResult<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationAtomResult")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Creates a mutation cell.
///
/// The cell reads idle until a mutation runs. With `throw_on_error` set, a
/// failed mutation is thrown from the read. Unmounting resets the mutation.
pub fn atom_with_mutation<T, V, F>(options: F, client: Option<ClientAccessor>) -> Atom<MutationAtomResult<T, V>>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<MutationOptions<T, V>, AtomError> + Send + Sync + 'static,
{
    let engine = MutationEngine::new(Arc::new(options), resolve_client(client));
    Atom::derived(move |get| {
        let (binding, result) = engine.read(get)?;
        if result.is_error() && binding.options.throw_on_error {
            if let Some(error) = &result.error {
                trace!(%error, "throwing mutation error");
                return Err(AtomError::Query(error.clone()));
            }
        }
        Ok(MutationAtomResult {
            result,
            observer: binding.observer,
        })
    })
}

type SelectFn<R> = Arc<dyn Fn(&MutationState) -> R + Send + Sync>;

/// Which pending mutations [`atom_with_mutation_state`] reports, and how.
pub struct MutationStateOptions<R> {
    pub filters: MutationFilters,
    select: SelectFn<R>,
}

impl MutationStateOptions<MutationState> {
    /// Reports the state of every pending mutation.
    pub fn new() -> Self {
        Self::select(MutationState::clone)
    }
}

impl Default for MutationStateOptions<MutationState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> MutationStateOptions<R> {
    /// Reports `select` of every pending mutation.
    pub fn select<F>(select: F) -> Self
    where
        F: Fn(&MutationState) -> R + Send + Sync + 'static,
    {
        Self {
            filters: MutationFilters::default(),
            select: Arc::new(select),
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: MutationFilters) -> Self {
        self.filters = filters;
        self
    }
}

impl<R> Clone for MutationStateOptions<R> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            select: Arc::clone(&self.select),
        }
    }
}

impl<R> fmt::Debug for MutationStateOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationStateOptions")
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Creates an atom listing the client's pending mutations.
///
/// The list is refreshed on every change of the client's mutation cache while
/// the atom is mounted.
pub fn atom_with_mutation_state<R, F>(options: F, client: Option<ClientAccessor>) -> Atom<Vec<R>>
where
    R: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<MutationStateOptions<R>, AtomError> + Send + Sync + 'static,
{
    let client = resolve_client(client);
    let versions: Mutex<HashMap<ClientId, Atom<u64>>> = Mutex::new(HashMap::new());
    Atom::derived(move |get| {
        let client = client(get)?;
        let version = versions
            .lock()
            .entry(client.id())
            .or_insert_with(|| cache_version(&client))
            .clone();
        get.get(&version)?;

        let options = options(get)?;
        let filters = options.filters.with_status(MutationStatus::Pending);
        Ok(client
            .mutation_cache()
            .find_all(&filters)
            .iter()
            .map(|state| (options.select)(state))
            .collect())
    })
}

/// Counter bumped on every change of `client`'s mutation cache while mounted.
fn cache_version(client: &QueryClient) -> Atom<u64> {
    let client = client.clone();
    Atom::with_on_mount(0, move |setter: AtomSetter<u64>| {
        let cache = client.mutation_cache();
        let listener = cache.subscribe({
            let setter = setter.clone();
            move |_| {
                let version = setter.get().unwrap_or(0);
                setter.set(version + 1);
            }
        });
        trace!(client = ?client.id(), "watching mutation cache");
        let client = client.clone();
        Some(Box::new(move || client.mutation_cache().unsubscribe(listener)) as OnUnmount)
    })
    .with_label("mutation_cache_version")
}
