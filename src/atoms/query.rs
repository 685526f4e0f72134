use std::sync::Arc;

use crate::bridge::{
    ClientAccessor, OptionsFn, QueryAction, QueryEngine, RefetchFuture, VariantPolicy,
    resolve_client,
};
use crate::error::AtomError;
use crate::query::{QueryObserver, QueryObserverResult, QueryOptions};
use crate::store::{Atom, Getter, WritableAtom};

/// A query cell: reads the query's result, takes [`QueryAction`]s.
pub type QueryAtom<T> =
    WritableAtom<QueryObserverResult<T>, QueryAction, RefetchFuture<QueryObserverResult<T>>>;

/// Creates a cell for the query described by `options`.
///
/// Reads return the current result, pending or not. An error is only thrown
/// when the options' `throw_on_error` says so.
///
/// # Example
///
/// ```rust
/// use query_atoms::atoms::atom_with_query;
/// use query_atoms::query::QueryOptions;
/// use query_atoms::query_key;
/// use query_atoms::store::Store;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let user = atom_with_query(
///     |_get| Ok(QueryOptions::new(query_key!["user", 1], |_ctx| async { Ok("alice") })),
///     None,
/// );
///
/// let store = Store::new();
/// let result = store.get(&user).unwrap();
/// assert!(result.is_pending());
/// # }
/// ```
pub fn atom_with_query<T, F>(options: F, client: Option<ClientAccessor>) -> QueryAtom<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<QueryOptions<T>, AtomError> + Send + Sync + 'static,
{
    QueryEngine::<QueryObserver<T>>::new(Arc::new(options), resolve_client(client), VariantPolicy::QUERY)
        .cell()
}

/// Creates a cell that suspends until the query has data.
///
/// The query is always enabled. Errors are thrown while there is no data to
/// show; a failed background refetch keeps the previous data.
pub fn atom_with_suspense_query<T, F>(options: F, client: Option<ClientAccessor>) -> QueryAtom<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<QueryOptions<T>, AtomError> + Send + Sync + 'static,
{
    QueryEngine::<QueryObserver<T>>::new(Arc::new(options), resolve_client(client), VariantPolicy::SUSPENSE)
        .cell()
}

/// Creates one query cell per options function.
pub fn atom_with_queries<T>(
    queries: Vec<OptionsFn<QueryOptions<T>>>,
    client: Option<ClientAccessor>,
) -> Vec<QueryAtom<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let client = resolve_client(client);
    queries
        .into_iter()
        .map(|options| {
            QueryEngine::<QueryObserver<T>>::new(options, Arc::clone(&client), VariantPolicy::QUERY).cell()
        })
        .collect()
}

/// Creates query cells and one atom combining their results.
pub fn atom_with_queries_combined<T, R, C>(
    queries: Vec<OptionsFn<QueryOptions<T>>>,
    combine: C,
    client: Option<ClientAccessor>,
) -> Atom<R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
    C: Fn(Vec<QueryObserverResult<T>>) -> R + Send + Sync + 'static,
{
    let cells = atom_with_queries(queries, client);
    Atom::derived(move |get| {
        let results = cells
            .iter()
            .map(|cell| get.get(cell))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(combine(results))
    })
}
