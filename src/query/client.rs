//! The query client: caches, defaults and bulk operations.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::debug;

use super::cache::QueryCache;
use super::config::QueryConfig;
use super::key::{QueryFilters, QueryKey, QueryTypeFilter};
use super::mutation::MutationOptions;
use super::mutation_cache::{MutationCache, MutationFilters};
use super::options::QueryOptions;
use super::state::QueryState;

/// Process-unique identity of a [`QueryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct ClientInner {
    id: ClientId,
    config: QueryConfig,
    query_cache: Arc<QueryCache>,
    mutation_cache: MutationCache,
}

/// Owns the query and mutation caches.
///
/// Cloning is cheap and every clone shares the same caches and identity.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use query_atoms::query::{QueryClient, QueryConfig};
/// use query_atoms::query_key;
///
/// let client = QueryClient::with_config(QueryConfig::new(Duration::from_secs(30), 1));
/// client.set_query_data(query_key!["greeting"], "hello".to_string());
///
/// assert_eq!(
///     client.get_query_data::<String>(&query_key!["greeting"]).as_deref(),
///     Some("hello")
/// );
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: ClientId::next(),
                config,
                query_cache: QueryCache::new(),
                mutation_cache: MutationCache::new(),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    /// Fills unset options with the client defaults.
    pub fn default_query_options<T>(&self, mut options: QueryOptions<T>) -> QueryOptions<T> {
        let config = self.config();
        options.stale_time.get_or_insert(config.stale_time);
        options.cache_time.get_or_insert(config.cache_time);
        options.retry.get_or_insert(config.retry);
        options.retry_delay.get_or_insert(config.retry_delay);
        options
    }

    pub fn default_mutation_options<T, V>(
        &self,
        mut options: MutationOptions<T, V>,
    ) -> MutationOptions<T, V> {
        let config = self.config();
        options.retry.get_or_insert(config.mutation_retry);
        options.retry_delay.get_or_insert(config.retry_delay);
        options
    }

    pub fn get_query_data<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.query_cache().find::<T>(key)?.state().data
    }

    /// Writes data into the cache, creating the query if needed.
    pub fn set_query_data<T>(&self, key: impl Into<QueryKey>, data: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let options = self.default_query_options(QueryOptions::keyed(key));
        let query = self.query_cache().build(&options);
        debug!(query = %query.hash(), "query data set");
        query.set_data(data);
    }

    pub fn get_query_state<T>(&self, key: &QueryKey) -> Option<QueryState<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.query_cache().find::<T>(key).map(|query| query.state())
    }

    /// Marks matching queries stale.
    ///
    /// The returned future refetches the matching active queries when polled;
    /// dropping it only invalidates.
    pub fn invalidate_queries(&self, filters: impl Into<QueryFilters>) -> BoxFuture<'static, ()> {
        let filters = filters.into();
        for query in self.query_cache().find_all(&filters) {
            query.invalidate();
        }
        self.refetch_active_later(filters)
    }

    /// Returns matching queries to their initial state.
    ///
    /// The returned future refetches the matching active queries when polled.
    pub fn reset_queries(&self, filters: impl Into<QueryFilters>) -> BoxFuture<'static, ()> {
        let filters = filters.into();
        for query in self.query_cache().find_all(&filters) {
            query.reset();
        }
        self.refetch_active_later(filters)
    }

    fn refetch_active_later(&self, filters: QueryFilters) -> BoxFuture<'static, ()> {
        let client = self.clone();
        async move {
            client
                .refetch_queries(filters.with_kind(QueryTypeFilter::Active))
                .await;
        }
        .boxed()
    }

    /// Removes matching queries from the cache. Returns how many were removed.
    pub fn remove_queries(&self, filters: impl Into<QueryFilters>) -> usize {
        self.query_cache().remove_matching(&filters.into())
    }

    /// Starts a refetch of every matching query that is not disabled.
    pub fn refetch_queries(&self, filters: impl Into<QueryFilters>) -> BoxFuture<'static, ()> {
        let fetches: Vec<_> = self
            .query_cache()
            .find_all(&filters.into())
            .into_iter()
            .filter(|query| !query.is_disabled())
            .map(|query| query.refetch())
            .collect();
        join_all(fetches).map(|_| ()).boxed()
    }

    pub fn cancel_queries(&self, filters: impl Into<QueryFilters>) {
        for query in self.query_cache().find_all(&filters.into()) {
            query.cancel();
        }
    }

    /// Number of matching queries with a fetch in flight.
    pub fn is_fetching(&self, filters: impl Into<QueryFilters>) -> usize {
        self.query_cache()
            .find_all(&filters.into())
            .iter()
            .filter(|query| query.is_fetching())
            .count()
    }

    /// Number of matching mutations still pending.
    pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
        self.mutation_cache().count_pending(filters)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for QueryClient {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for QueryClient {}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::query::state::FetchRequest;
    use crate::query_key;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_clients_have_distinct_ids() {
        let a = QueryClient::new();
        let b = QueryClient::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_default_query_options_only_fill_gaps() {
        let client = QueryClient::with_config(QueryConfig::new(Duration::from_secs(9), 2));
        let options = client
            .default_query_options(QueryOptions::<i32>::keyed(query_key!["a"]).with_retry(0));
        assert_eq!(options.stale_time, Some(Duration::from_secs(9)));
        assert_eq!(options.retry, Some(0));
    }

    #[test]
    fn test_set_and_get_query_data() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["n"], 5_i32);

        assert_eq!(client.get_query_data::<i32>(&query_key!["n"]), Some(5));
        assert_eq!(client.get_query_data::<i32>(&query_key!["missing"]), None);
        let state = client.get_query_state::<i32>(&query_key!["n"]);
        assert_eq!(state.map(|s| s.data_update_count), Some(1));
    }

    #[tokio::test]
    async fn test_invalidate_refetches_only_when_awaited() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = {
            let calls = Arc::clone(&calls);
            client.default_query_options(QueryOptions::new(query_key!["todos", 1], move |_| {
                let calls = Arc::clone(&calls);
                async move { Ok::<_, QueryError>(calls.fetch_add(1, Ordering::SeqCst)) }
            }))
        };
        let query = client.query_cache().build(&options);
        let _ = query.fetch(None, FetchRequest::default()).await;

        drop(client.invalidate_queries(QueryFilters::key("todos")));
        assert!(query.state().is_invalidated);
        // no observer, so the query is not active and is not refetched
        client.invalidate_queries(QueryFilters::key("todos")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.refetch_queries(QueryFilters::all()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!query.state().is_invalidated);
    }

    #[test]
    fn test_remove_queries() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["a", 1], 1_i32);
        client.set_query_data(query_key!["a", 2], 2_i32);
        client.set_query_data(query_key!["b"], 3_i32);

        assert_eq!(client.remove_queries(QueryFilters::key("a")), 2);
        assert_eq!(client.query_cache().len(), 1);
        assert_eq!(client.is_fetching(QueryFilters::all()), 0);
    }
}
