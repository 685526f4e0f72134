//! Observers: the subscribable view of one query under one set of options.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::emitter::{Emitter, ListenerId};

use super::client::QueryClient;
use super::options::{Placeholder, QueryOptions};
use super::result::QueryObserverResult;
use super::state::{FetchFuture, FetchRequest, FetchStatus, Query, QueryStatus};

/// Process-unique identity of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Options of an explicit refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Cancel a running fetch and start over when the query already has data.
    /// Otherwise the refetch joins the running fetch.
    pub cancel_refetch: bool,
    /// Report a failed refetch as an error to whoever awaits it, instead of
    /// resolving with the error result.
    pub throw_on_error: bool,
}

impl RefetchOptions {
    #[must_use]
    pub const fn with_cancel_refetch(mut self, cancel_refetch: bool) -> Self {
        self.cancel_refetch = cancel_refetch;
        self
    }

    #[must_use]
    pub const fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }
}

impl Default for RefetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            throw_on_error: true,
        }
    }
}

/// Identifies a distinct result; listeners are only called when it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ResultKey {
    query: u64,
    revision: u64,
    is_stale: bool,
    is_placeholder_data: bool,
}

struct ObserverInner<T> {
    options: QueryOptions<T>,
    query: Arc<Query<T>>,
    query_listener: Option<ListenerId>,
    result: QueryObserverResult<T>,
    result_key: ResultKey,
}

/// Watches one query of a [`QueryClient`].
///
/// The first subscriber attaches the observer to its query and fetches if the
/// query has no data or stale data. Replacing the options may switch to another
/// query; the observer follows it and fetches when that query is stale. The
/// last unsubscribe detaches the observer again.
pub struct QueryObserver<T> {
    id: ObserverId,
    client: QueryClient,
    this: Weak<Self>,
    inner: Mutex<ObserverInner<T>>,
    events: Emitter<QueryObserverResult<T>>,
}

impl<T> QueryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(client: &QueryClient, options: QueryOptions<T>) -> Arc<Self> {
        let options = client.default_query_options(options);
        let query = client.query_cache().build(&options);
        query.set_options(&options);
        let (result, result_key) = create_result(&query, &options, None, false);
        let observer = Arc::new_cyclic(|this| Self {
            id: ObserverId::next(),
            client: client.clone(),
            this: this.clone(),
            inner: Mutex::new(ObserverInner {
                options,
                query,
                query_listener: None,
                result,
                result_key,
            }),
            events: Emitter::new(),
        });
        debug!(observer = ?observer.id, query = %observer.current_query().hash(), "observer created");
        observer
    }

    pub const fn id(&self) -> ObserverId {
        self.id
    }

    pub const fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.inner.lock().options.clone()
    }

    pub fn current_query(&self) -> Arc<Query<T>> {
        Arc::clone(&self.inner.lock().query)
    }

    pub fn current_result(&self) -> QueryObserverResult<T> {
        self.inner.lock().result.clone()
    }

    pub fn has_listeners(&self) -> bool {
        !self.events.is_empty()
    }

    /// Changes whenever the current query changes state, is replaced, or
    /// turns stale.
    pub fn revision(&self) -> u64 {
        let (query, stale_time) = {
            let inner = self.inner.lock();
            (Arc::clone(&inner.query), inner.options.resolved_stale_time())
        };
        let mut hasher = DefaultHasher::new();
        (query.id(), query.revision(), query.is_stale(stale_time)).hash(&mut hasher);
        hasher.finish()
    }

    /// Replaces the options, switching query if the key changed.
    pub fn set_options(&self, options: QueryOptions<T>) {
        let options = self.client.default_query_options(options);
        let query = self.client.query_cache().build(&options);
        let mounted = self.has_listeners();
        let (prev_query, prev_options, old_listener) = {
            let mut inner = self.inner.lock();
            let prev_query = std::mem::replace(&mut inner.query, Arc::clone(&query));
            let prev_options = std::mem::replace(&mut inner.options, options.clone());
            let switched = !Arc::ptr_eq(&prev_query, &query);
            let old_listener = if switched { inner.query_listener.take() } else { None };
            (prev_query, prev_options, old_listener)
        };
        let switched = !Arc::ptr_eq(&prev_query, &query);
        trace!(observer = ?self.id, query = %query.hash(), switched, "observer options replaced");
        query.set_options(&options);

        if mounted {
            if switched {
                if let Some(listener) = old_listener {
                    prev_query.unsubscribe(listener);
                }
                prev_query.remove_observer(self.id);
                self.client.query_cache().schedule_gc(&prev_query);
                self.attach(&query);
            }
            query.add_observer(self.id, options.enabled);
            if should_fetch_optionally(&query, &prev_query, &options, &prev_options) {
                drop(self.execute_fetch(FetchRequest::default()));
            }
        }
        self.update_result();
    }

    /// Result as it would be with `options`, including a fetch those options
    /// are about to start.
    pub fn optimistic_result(&self, options: &QueryOptions<T>) -> QueryObserverResult<T> {
        let options = self.client.default_query_options(options.clone());
        let query = self.client.query_cache().build(&options);
        let (prev_query, prev_options, previous) = {
            let inner = self.inner.lock();
            (
                Arc::clone(&inner.query),
                inner.options.clone(),
                inner.result.clone(),
            )
        };
        let fetch_now = if self.has_listeners() {
            should_fetch_optionally(&query, &prev_query, &options, &prev_options)
        } else {
            should_fetch_on_mount(&query, &options)
        };
        create_result(&query, &options, Some(&previous), fetch_now).0
    }

    /// Fetches the query for `options` and resolves with the settled result.
    ///
    /// Never fails: a failed fetch resolves with an error result.
    pub fn fetch_optimistic(
        &self,
        options: &QueryOptions<T>,
    ) -> BoxFuture<'static, QueryObserverResult<T>> {
        let options = self.client.default_query_options(options.clone());
        let query = self.client.query_cache().build(&options);
        let fetch = query.fetch(Some(&options), FetchRequest::default());
        async move {
            let _ = fetch.await;
            create_result(&query, &options, None, false).0
        }
        .boxed()
    }

    /// Refetches the current query.
    ///
    /// With `cancel_refetch` a running fetch is cancelled when the query has
    /// data; otherwise the refetch joins it.
    pub fn refetch(&self, options: RefetchOptions) -> BoxFuture<'static, QueryObserverResult<T>> {
        let request = FetchRequest {
            cancel_refetch: options.cancel_refetch,
            ..FetchRequest::refetch()
        };
        let fetch = self.execute_fetch(request);
        let this = self.this.clone();
        async move {
            let _ = fetch.await;
            match this.upgrade() {
                Some(observer) => {
                    observer.update_result();
                    observer.current_result()
                }
                None => QueryObserverResult::cancelled(),
            }
        }
        .boxed()
    }

    /// Fetches the current query with the current options.
    pub(crate) fn execute_fetch(&self, request: FetchRequest) -> FetchFuture<T> {
        let (query, options) = self.live_query();
        query.fetch(Some(&options), request)
    }

    /// The current query and options. A query that left the client's cache
    /// is replaced by the one now cached for its key.
    fn live_query(&self) -> (Arc<Query<T>>, QueryOptions<T>) {
        let (query, options) = {
            let inner = self.inner.lock();
            (Arc::clone(&inner.query), inner.options.clone())
        };
        if !query.is_removed() {
            return (query, options);
        }
        let fresh = self.client.query_cache().build(&options);
        fresh.set_options(&options);
        trace!(observer = ?self.id, query = %fresh.hash(), "following a replaced query");
        let mut inner = self.inner.lock();
        if Arc::ptr_eq(&inner.query, &query) {
            inner.query = Arc::clone(&fresh);
        }
        (Arc::clone(&inner.query), options)
    }

    /// Detaches from the current query and removes it from the client's
    /// cache. Other observers of the query move on to a fresh one.
    pub fn remove(&self) {
        let (query, listener) = {
            let mut inner = self.inner.lock();
            (Arc::clone(&inner.query), inner.query_listener.take())
        };
        debug!(observer = ?self.id, query = %query.hash(), "removing query");
        if let Some(listener) = listener {
            query.unsubscribe(listener);
        }
        query.remove_observer(self.id);
        self.client.query_cache().remove(&query);
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult<T>) + Send + Sync + 'static,
    ) -> ListenerId {
        let first = self.events.is_empty();
        let id = self.events.on(listener);
        if first {
            self.on_subscribe();
        }
        id
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        if self.events.off(listener) && self.events.is_empty() {
            self.on_unsubscribe();
        }
    }

    fn on_subscribe(&self) {
        let (query, options) = self.live_query();
        trace!(observer = ?self.id, query = %query.hash(), "observer attached");
        self.attach(&query);
        query.add_observer(self.id, options.enabled);
        if should_fetch_on_mount(&query, &options) {
            drop(self.execute_fetch(FetchRequest::default()));
        }
        self.update_result();
    }

    fn on_unsubscribe(&self) {
        let (query, listener) = {
            let mut inner = self.inner.lock();
            (Arc::clone(&inner.query), inner.query_listener.take())
        };
        trace!(observer = ?self.id, query = %query.hash(), "observer detached");
        if let Some(listener) = listener {
            query.unsubscribe(listener);
        }
        query.remove_observer(self.id);
        self.client.query_cache().schedule_gc(&query);
    }

    fn attach(&self, query: &Arc<Query<T>>) {
        let this = self.this.clone();
        let listener = query.subscribe(move |_| {
            if let Some(observer) = this.upgrade() {
                observer.on_query_change();
            }
        });
        let stale = {
            let mut inner = self.inner.lock();
            if Arc::ptr_eq(&inner.query, query) {
                inner.query_listener.replace(listener)
            } else {
                // switched away while attaching
                Some(listener)
            }
        };
        if let Some(stale) = stale {
            query.unsubscribe(stale);
        }
    }

    fn on_query_change(&self) {
        if self.current_query().is_removed() {
            // the query left the cache; switch to its successor
            self.set_options(self.options());
            return;
        }
        self.update_result();
    }

    /// Recomputes the result and notifies listeners if it changed.
    pub(crate) fn update_result(&self) {
        let result = {
            let mut inner = self.inner.lock();
            let (result, key) = create_result(&inner.query, &inner.options, Some(&inner.result), false);
            if key == inner.result_key {
                return;
            }
            inner.result = result.clone();
            inner.result_key = key;
            result
        };
        self.events.emit(&result);
    }
}

impl<T> fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.id)
            .field("client", &self.client.id())
            .field("listeners", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Fetch when an observer attaches: no data yet (unless the query failed and
/// `retry_on_mount` is off), or stale data with `refetch_on_mount`.
fn should_fetch_on_mount<T>(query: &Query<T>, options: &QueryOptions<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    if !options.enabled {
        return false;
    }
    let state = query.state();
    if state.data_updated_at.is_none() {
        return !(state.status == QueryStatus::Error && !options.retry_on_mount);
    }
    options.refetch_on_mount && state.is_stale(options.resolved_stale_time())
}

/// Fetch after an options change: the query changed and is stale, or a query
/// that never loaded was just enabled.
fn should_fetch_optionally<T>(
    query: &Arc<Query<T>>,
    prev_query: &Arc<Query<T>>,
    options: &QueryOptions<T>,
    prev_options: &QueryOptions<T>,
) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    if !options.enabled {
        return false;
    }
    let state = query.state();
    if options.suspense && state.status == QueryStatus::Error {
        return false;
    }
    let switched = !Arc::ptr_eq(query, prev_query);
    let enabled_now = !prev_options.enabled && state.data_updated_at.is_none();
    (switched && state.is_stale(options.resolved_stale_time())) || enabled_now
}

fn create_result<T>(
    query: &Query<T>,
    options: &QueryOptions<T>,
    previous: Option<&QueryObserverResult<T>>,
    fetch_now: bool,
) -> (QueryObserverResult<T>, ResultKey)
where
    T: Clone + Send + Sync + 'static,
{
    let (mut state, revision) = query.snapshot();
    if fetch_now {
        state.fetch_status = FetchStatus::Fetching;
        if state.data_updated_at.is_none() {
            state.error = None;
            state.status = QueryStatus::Pending;
        }
    }

    let is_stale = state.is_stale(options.resolved_stale_time());
    let mut data = state.data;
    let mut status = state.status;
    let mut is_placeholder_data = false;
    if data.is_none() && status == QueryStatus::Pending {
        let placeholder = match &options.placeholder {
            Placeholder::None => None,
            Placeholder::Value(value) => Some(value.clone()),
            Placeholder::KeepPrevious => previous.and_then(|previous| previous.data.clone()),
        };
        if placeholder.is_some() {
            data = placeholder;
            status = QueryStatus::Success;
            is_placeholder_data = true;
        }
    }

    let result = QueryObserverResult {
        data,
        data_updated_at: state.data_updated_at,
        error: state.error,
        error_updated_at: state.error_updated_at,
        error_update_count: state.error_update_count,
        failure_count: state.fetch_failure_count,
        status,
        fetch_status: state.fetch_status,
        fetch_direction: state.fetch_direction,
        is_placeholder_data,
        is_stale,
        is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
    };
    let key = ResultKey {
        query: query.id(),
        revision,
        is_stale,
        is_placeholder_data,
    };
    (result, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::query_key;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(key: &str, calls: &Arc<AtomicUsize>) -> QueryOptions<usize> {
        let calls = Arc::clone(calls);
        QueryOptions::new(query_key![key], move |_| {
            let calls = Arc::clone(&calls);
            async move { Ok::<_, QueryError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
        })
        .with_retry(0)
    }

    #[tokio::test]
    async fn test_fetches_on_first_subscribe_only() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("a", &calls));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let first = observer.subscribe(|_| {});
        let second = observer.subscribe(|_| {});
        assert!(observer.current_result().is_loading());

        let result = observer.refetch(RefetchOptions::default()).await;
        assert_eq!(result.data, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        observer.unsubscribe(first);
        observer.unsubscribe(second);
        assert!(!observer.current_query().has_observers());
    }

    #[tokio::test]
    async fn test_disabled_query_reports_idle_pending() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("off", &calls).with_enabled(false));
        let _listener = observer.subscribe(|_| {});

        let result = observer.current_result();
        assert!(result.is_pending());
        assert_eq!(result.fetch_status, FetchStatus::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        observer.set_options(counting("off", &calls));
        assert!(observer.current_result().is_loading());
        // the refetch joins the fetch started by enabling
        let result = observer.refetch(RefetchOptions::default()).await;
        assert_eq!(result.data, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_optimistic_result_predicts_mount_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting("opt", &calls);
        let observer = QueryObserver::new(&client, options.clone());

        assert_eq!(observer.current_result().fetch_status, FetchStatus::Idle);
        assert!(observer.optimistic_result(&options).is_loading());
        assert!(
            !observer
                .optimistic_result(&options.clone().with_enabled(false))
                .is_fetching()
        );
    }

    #[tokio::test]
    async fn test_key_change_switches_query() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("x", &calls));
        let _listener = observer.subscribe(|_| {});
        observer.refetch(RefetchOptions::default()).await;

        let first = observer.current_query();
        observer.set_options(counting("y", &calls).with_placeholder(Placeholder::KeepPrevious));
        let second = observer.current_query();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.has_observers());
        let result = observer.current_result();
        assert!(result.is_placeholder_data);
        assert!(result.data.is_some());
    }

    #[tokio::test]
    async fn test_fresh_data_is_not_refetched_on_mount() {
        let client = QueryClient::new();
        client.set_query_data(query_key!["fresh"], 10_usize);
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(
            &client,
            counting("fresh", &calls).with_stale_time(Duration::from_secs(60)),
        );

        let _listener = observer.subscribe(|_| {});
        assert_eq!(observer.current_result().data, Some(10));
        assert!(!observer.current_result().is_fetching());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_optimistic_resolves_on_error() {
        let client = QueryClient::new();
        let options = QueryOptions::<i32>::new(query_key!["bad"], |_| async {
            Err(QueryError::FetchError("nope".into()))
        })
        .with_retry(0);
        let observer = QueryObserver::new(&client, options.clone());

        let result = observer.fetch_optimistic(&options).await;
        assert!(result.is_error());
        assert_eq!(result.error, Some(QueryError::FetchError("nope".into())));
    }

    #[tokio::test]
    async fn test_remove_evicts_query() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = QueryObserver::new(&client, counting("rm", &calls));
        assert_eq!(client.query_cache().len(), 1);

        observer.remove();
        assert!(client.query_cache().is_empty());
    }
}
