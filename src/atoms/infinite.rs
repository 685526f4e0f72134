use std::sync::Arc;

use crate::bridge::{
    ClientAccessor, InfiniteQueryAction, QueryEngine, RefetchFuture, VariantPolicy, resolve_client,
};
use crate::error::AtomError;
use crate::query::{InfiniteQueryObserver, InfiniteQueryObserverResult, InfiniteQueryOptions};
use crate::store::{Getter, WritableAtom};

/// An infinite query cell: reads the loaded pages, takes
/// [`InfiniteQueryAction`]s to load more.
pub type InfiniteQueryAtom<T, P> = WritableAtom<
    InfiniteQueryObserverResult<T, P>,
    InfiniteQueryAction,
    RefetchFuture<InfiniteQueryObserverResult<T, P>>,
>;

pub fn atom_with_infinite_query<T, P, F>(options: F, client: Option<ClientAccessor>) -> InfiniteQueryAtom<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<InfiniteQueryOptions<T, P>, AtomError> + Send + Sync + 'static,
{
    QueryEngine::<InfiniteQueryObserver<T, P>>::new(Arc::new(options), resolve_client(client), VariantPolicy::QUERY)
        .cell()
}

/// Like [`atom_with_infinite_query`], suspending until the first page is in.
pub fn atom_with_suspense_infinite_query<T, P, F>(
    options: F,
    client: Option<ClientAccessor>,
) -> InfiniteQueryAtom<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    F: Fn(&Getter<'_>) -> Result<InfiniteQueryOptions<T, P>, AtomError> + Send + Sync + 'static,
{
    QueryEngine::<InfiniteQueryObserver<T, P>>::new(
        Arc::new(options),
        resolve_client(client),
        VariantPolicy::SUSPENSE,
    )
    .cell()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::provide_query_client;
    use crate::query::QueryClient;
    use crate::query_key;
    use crate::store::Store;

    fn numbers() -> InfiniteQueryOptions<u32, u32> {
        InfiniteQueryOptions::new(
            query_key!["numbers"],
            1,
            |ctx| async move { Ok(ctx.page_param * 10) },
            |_, param| Some(param + 1),
        )
    }

    #[tokio::test]
    async fn test_suspense_infinite_query_loads_pages() {
        let store = Store::new();
        provide_query_client(&store, QueryClient::new());
        let cell = atom_with_suspense_infinite_query(|_| Ok(numbers()), None);

        let first = store.get_async(&cell).await.unwrap();
        assert_eq!(first.data.as_ref().map(|d| d.pages.clone()), Some(vec![10]));
        assert!(first.has_next_page);

        let next = store
            .write(&cell, InfiniteQueryAction::FetchNextPage)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.result.data.map(|d| d.pages), Some(vec![10, 20]));
    }
}
