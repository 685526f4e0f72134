use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use super::config::DEFAULT_CACHE_TIME;
use super::key::{QueryFilters, QueryKey};
use super::options::QueryOptions;
use super::state::{FetchRequest, Query};

/// Type-erased operations the client runs over many queries at once.
pub(crate) trait AnyQuery: Send + Sync {
    fn key(&self) -> &QueryKey;

    fn is_active(&self) -> bool;

    fn is_fetching(&self) -> bool;

    fn is_disabled(&self) -> bool;

    fn invalidate(&self);

    fn reset(&self);

    fn cancel(&self);

    fn destroy(&self);

    /// Starts a refetch with the query's own options.
    fn refetch(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

impl<T> AnyQuery for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &QueryKey {
        Query::key(self)
    }

    fn is_active(&self) -> bool {
        Query::is_active(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn is_disabled(&self) -> bool {
        self.has_observers() && !Query::is_active(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self);
    }

    fn reset(&self) {
        Query::reset(self);
    }

    fn cancel(&self) {
        Query::cancel(self);
    }

    fn destroy(&self) {
        Query::destroy(self);
    }

    fn refetch(self: Arc<Self>) -> BoxFuture<'static, ()> {
        let fetch = self.fetch(None, FetchRequest::refetch());
        async move {
            let _ = fetch.await;
        }
        .boxed()
    }
}

struct CachedQuery {
    erased: Arc<dyn AnyQuery>,
    typed: Arc<dyn Any + Send + Sync>,
}

impl CachedQuery {
    fn new<T>(query: &Arc<Query<T>>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self {
            erased: Arc::clone(query) as Arc<dyn AnyQuery>,
            typed: Arc::clone(query) as Arc<dyn Any + Send + Sync>,
        }
    }

    fn downcast<T>(&self) -> Option<Arc<Query<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Arc::clone(&self.typed).downcast::<Query<T>>().ok()
    }
}

/// All queries of one client, keyed by data type and query hash.
///
/// A query without observers is removed once it has stayed unobserved for its
/// `cache_time`. Collection needs a Tokio runtime; without one queries stay
/// until removed explicitly.
pub struct QueryCache {
    this: Weak<Self>,
    queries: DashMap<(TypeId, String), CachedQuery>,
}

impl QueryCache {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            queries: DashMap::new(),
        })
    }

    /// Returns the query for `options`, creating it if needed.
    pub fn build<T>(&self, options: &QueryOptions<T>) -> Arc<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = (TypeId::of::<T>(), options.query_hash());
        if let Some(query) = self.queries.get(&key).and_then(|entry| entry.downcast::<T>()) {
            return query;
        }
        let query = Query::new(options);
        debug!(query = %query.hash(), "query created");
        self.queries.insert(key, CachedQuery::new(&query));
        self.schedule_gc(&query);
        query
    }

    /// Removes `query` after its `cache_time` unless an observer shows up.
    pub(crate) fn schedule_gc<T>(&self, query: &Arc<Query<T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        if query.has_observers() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache_time = query.options().cache_time.unwrap_or(DEFAULT_CACHE_TIME);
        let cache = self.this.clone();
        let query = Arc::downgrade(query);
        runtime.spawn(async move {
            tokio::time::sleep(cache_time).await;
            let (Some(cache), Some(query)) = (cache.upgrade(), query.upgrade()) else {
                return;
            };
            if query.should_gc(cache_time) {
                trace!(query = %query.hash(), "collecting unused query");
                cache.remove(&query);
            }
        });
    }

    pub fn find<T>(&self, key: &QueryKey) -> Option<Arc<Query<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.queries
            .get(&(TypeId::of::<T>(), key.query_hash()))
            .and_then(|entry| entry.downcast::<T>())
    }

    pub(crate) fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<dyn AnyQuery>> {
        self.queries
            .iter()
            .filter(|entry| filters.matches(entry.erased.key(), entry.erased.is_active()))
            .map(|entry| Arc::clone(&entry.erased))
            .collect()
    }

    /// Removes `query` if it is still the cached instance for its key.
    pub fn remove<T>(&self, query: &Arc<Query<T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = (TypeId::of::<T>(), query.hash().to_string());
        let removed = self.queries.remove_if(&key, |_, entry| {
            entry
                .downcast::<T>()
                .is_some_and(|cached| Arc::ptr_eq(&cached, query))
        });
        if removed.is_some() {
            debug!(query = %query.hash(), "query removed");
            query.destroy();
        }
    }

    pub(crate) fn remove_matching(&self, filters: &QueryFilters) -> usize {
        let mut removed = Vec::new();
        self.queries.retain(|_, entry| {
            let keep = !filters.matches(entry.erased.key(), entry.erased.is_active());
            if !keep {
                removed.push(Arc::clone(&entry.erased));
            }
            keep
        });
        for query in &removed {
            debug!(query = %query.key(), "query removed");
            query.destroy();
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.queries.len())
            .finish()
    }
}
