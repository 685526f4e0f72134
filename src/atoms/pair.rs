//! Cells that come in pairs: one for the data, one for the status.
//!
//! The data cell suspends until there is data and throws the query error, so a
//! reader only sees a value. The status cell never suspends or throws.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::trace;

use crate::bridge::{
    ClientAccessor, EngineObserver, EngineQueryObserver, InfiniteQueryAction, MutateFuture,
    MutationEngine, QueryAction, QueryEngine, RefetchFuture, VariantPolicy, next_push,
    resolve_client,
};
use crate::error::{AtomError, QueryError};
use crate::query::{
    InfiniteData, InfiniteQueryObserver, InfiniteQueryObserverResult, InfiniteQueryOptions,
    MutateOptions, MutationObserverResult, MutationOptions, QueryObserver, QueryObserverResult,
    QueryOptions,
};
use crate::store::{Atom, Getter, Setter, Suspense, WritableAtom};

pub type QueryDataAtom<T> = WritableAtom<T, QueryAction, RefetchFuture<QueryObserverResult<T>>>;

pub type QueryStatusAtom<T> =
    WritableAtom<QueryObserverResult<T>, QueryAction, RefetchFuture<QueryObserverResult<T>>>;

pub type InfiniteQueryDataAtom<T, P> = WritableAtom<
    InfiniteData<T, P>,
    InfiniteQueryAction,
    RefetchFuture<InfiniteQueryObserverResult<T, P>>,
>;

pub type InfiniteQueryStatusAtom<T, P> = WritableAtom<
    InfiniteQueryObserverResult<T, P>,
    InfiniteQueryAction,
    RefetchFuture<InfiniteQueryObserverResult<T, P>>,
>;

pub type MutationDataAtom<T, V> = WritableAtom<T, (V, MutateOptions<T, V>), MutateFuture<T>>;

pub type MutationStatusAtom<T, V> =
    WritableAtom<MutationObserverResult<T, V>, (V, MutateOptions<T, V>), MutateFuture<T>>;

type Cell<O, T> = WritableAtom<
    T,
    <O as EngineQueryObserver>::Action,
    RefetchFuture<<O as EngineObserver>::Result>,
>;

type Pair<O> = (
    Cell<O, <O as EngineQueryObserver>::Data>,
    Cell<O, <O as EngineObserver>::Result>,
);

fn query_pair<O: EngineQueryObserver>(engine: QueryEngine<O>) -> Pair<O> {
    let status = engine.cell();
    let data = {
        let status = status.clone();
        Atom::derived(move |get| {
            // the status cell carries the subscription and the revision
            let result = get.get(&status)?;
            let snapshot = O::snapshot(&result);
            if snapshot.is_error() && !snapshot.is_fetching() {
                if let Some(error) = snapshot.error.as_ref().filter(|e| !e.is_cancelled()) {
                    return Err(AtomError::Query(error.clone()));
                }
            }
            if let Some(data) = &snapshot.data {
                return Ok(data.clone());
            }
            let binding = get.get(&engine.binding)?;
            Err(AtomError::Suspended(QueryEngine::<O>::wait_for_data(&binding, &result)))
        })
    };
    let forward = status.clone();
    let data = data.writable(move |set: &Setter<'_>, action: O::Action| set.write(&forward, action));
    (data, status)
}

/// Creates a data cell and a status cell for one query.
///
/// Both share an observer. Writes to either one refetch.
pub fn atoms_with_query<T, F>(options: F, client: Option<ClientAccessor>) -> (QueryDataAtom<T>, QueryStatusAtom<T>)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<QueryOptions<T>, AtomError> + Send + Sync + 'static,
{
    query_pair(QueryEngine::<QueryObserver<T>>::new(
        Arc::new(options),
        resolve_client(client),
        VariantPolicy::STATUS,
    ))
}

type PendingOptions<T> = Shared<BoxFuture<'static, Result<QueryOptions<T>, QueryError>>>;

/// Like [`atoms_with_query`], with options that take a while to produce.
///
/// `options` may read atoms and returns a future of the options. Both cells
/// suspend until it resolves and throw its error. When an atom it read
/// changes, the options are produced again.
pub fn atoms_with_query_async<T, F, Fut>(
    options: F,
    client: Option<ClientAccessor>,
) -> (QueryDataAtom<T>, QueryStatusAtom<T>)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<Fut, AtomError> + Send + Sync + 'static,
    Fut: Future<Output = Result<QueryOptions<T>, QueryError>> + Send + 'static,
{
    let pending: Atom<PendingOptions<T>> =
        Atom::derived(move |get| Ok(options(get)?.boxed().shared())).with_label("pending_options");
    let resolved = move |get: &Getter<'_>| {
        let pending = get.get(&pending)?;
        match pending.peek() {
            Some(Ok(options)) => Ok(options.clone()),
            Some(Err(error)) => Err(AtomError::Query(error.clone())),
            None => {
                trace!("waiting for query options");
                Err(AtomError::Suspended(Suspense::new(pending.map(|_| ()))))
            }
        }
    };
    query_pair(QueryEngine::<QueryObserver<T>>::new(
        Arc::new(resolved),
        resolve_client(client),
        VariantPolicy::STATUS,
    ))
}

/// Creates a data cell and a status cell for one infinite query.
pub fn atoms_with_infinite_query<T, P, F>(
    options: F,
    client: Option<ClientAccessor>,
) -> (InfiniteQueryDataAtom<T, P>, InfiniteQueryStatusAtom<T, P>)
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<InfiniteQueryOptions<T, P>, AtomError> + Send + Sync + 'static,
{
    query_pair(QueryEngine::<InfiniteQueryObserver<T, P>>::new(
        Arc::new(options),
        resolve_client(client),
        VariantPolicy::STATUS,
    ))
}

/// Creates a data cell and a status cell for one mutation.
///
/// Writing `(variables, options)` to either starts a mutation. The data cell
/// suspends until a mutation succeeds and throws when it fails.
pub fn atoms_with_mutation<T, V, F>(
    options: F,
    client: Option<ClientAccessor>,
) -> (MutationDataAtom<T, V>, MutationStatusAtom<T, V>)
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<MutationOptions<T, V>, AtomError> + Send + Sync + 'static,
{
    let engine = MutationEngine::new(Arc::new(options), resolve_client(client));

    let status = {
        let engine = engine.clone();
        Atom::derived(move |get| engine.read(get).map(|(_, result)| result))
    };
    let data = {
        let engine = engine.clone();
        Atom::derived(move |get| {
            let (binding, result) = engine.read(get)?;
            if result.is_success() {
                if let Some(data) = result.data {
                    return Ok(data);
                }
            }
            if let Some(error) = result.error.filter(|e| !e.is_cancelled()) {
                return Err(AtomError::Query(error));
            }
            Err(AtomError::Suspended(next_push(&binding.observer)))
        })
    };

    let mutate = {
        let engine = engine.clone();
        move |set: &Setter<'_>, (variables, options): (V, MutateOptions<T, V>)| {
            engine.mutate(set.store(), variables, options)
        }
    };
    (data.writable(mutate.clone()), status.writable(mutate))
}
