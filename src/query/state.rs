//! A single cached query and its fetch state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::emitter::{Emitter, ListenerId};
use crate::error::QueryError;

use super::config::RetryDelay;
use super::key::QueryKey;
use super::observer::ObserverId;
use super::options::{FetchContext, QueryFn, QueryOptions};

/// Whether a query has data, an error, or neither yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Error,
    Success,
}

/// Whether a fetch is currently running for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Fetching,
    Idle,
}

/// Page direction of an infinite query fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Snapshot of a query's state.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub data_updated_at: Option<Instant>,
    pub data_update_count: u32,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub error_update_count: u32,
    pub fetch_failure_count: u32,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub is_invalidated: bool,
    pub fetch_direction: Option<FetchDirection>,
}

impl<T> QueryState<T> {
    /// State of a query that was never fetched, seeded with `initial_data`.
    pub fn initial(initial_data: Option<T>) -> Self {
        let has_data = initial_data.is_some();
        Self {
            data: initial_data,
            data_updated_at: has_data.then(Instant::now),
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            status: if has_data {
                QueryStatus::Success
            } else {
                QueryStatus::Pending
            },
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            fetch_direction: None,
        }
    }

    /// Stale when invalidated, without data, or older than `stale_time`.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.data_updated_at {
            Some(updated_at) if self.data.is_some() => updated_at + stale_time <= Instant::now(),
            _ => true,
        }
    }
}

/// Options controlling a single call to [`Query::fetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRequest {
    /// Cancel a running fetch and start over if the query already has data.
    pub cancel_refetch: bool,
    pub direction: Option<FetchDirection>,
}

impl FetchRequest {
    pub const fn refetch() -> Self {
        Self {
            cancel_refetch: true,
            direction: None,
        }
    }

    pub const fn page(direction: FetchDirection) -> Self {
        Self {
            cancel_refetch: true,
            direction: Some(direction),
        }
    }
}

/// Shared result of an in-flight fetch.
pub type FetchFuture<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

/// Handle for a running fetch task.
struct FetchHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl FetchHandle {
    fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Cancel the fetch; its task finishes on its own.
    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

struct InFlight<T> {
    id: u64,
    handle: FetchHandle,
    future: FetchFuture<T>,
}

struct QueryInner<T> {
    state: QueryState<T>,
    revision: u64,
    options: QueryOptions<T>,
    in_flight: Option<InFlight<T>>,
    observers: HashMap<ObserverId, bool>,
    /// Since when no observer is attached.
    unobserved_since: Option<Instant>,
    removed: bool,
    next_fetch: u64,
}

/// A cached query.
///
/// Holds the state for one key, runs fetches for it (at most one at a time;
/// concurrent callers share the running fetch), and notifies its listeners on
/// every state change.
pub struct Query<T> {
    id: u64,
    key: QueryKey,
    hash: String,
    inner: Mutex<QueryInner<T>>,
    events: Emitter<()>,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(options: &QueryOptions<T>) -> Arc<Self> {
        static NEXT_QUERY: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_QUERY.fetch_add(1, Ordering::Relaxed),
            key: options.query_key.clone(),
            hash: options.query_hash(),
            inner: Mutex::new(QueryInner {
                state: QueryState::initial(options.initial_data.clone()),
                revision: 0,
                options: options.clone(),
                in_flight: None,
                observers: HashMap::new(),
                unobserved_since: Some(Instant::now()),
                removed: false,
                next_fetch: 0,
            }),
            events: Emitter::new(),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> QueryState<T> {
        self.inner.lock().state.clone()
    }

    /// Increases on every state change.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// State and revision read under one lock.
    pub(crate) fn snapshot(&self) -> (QueryState<T>, u64) {
        let inner = self.inner.lock();
        (inner.state.clone(), inner.revision)
    }

    pub fn options(&self) -> QueryOptions<T> {
        self.inner.lock().options.clone()
    }

    /// Replaces the options used by fetches that are not given their own.
    pub(crate) fn set_options(&self, options: &QueryOptions<T>) {
        let mut inner = self.inner.lock();
        if options.query_fn().is_some() || inner.options.query_fn().is_none() {
            inner.options = options.clone();
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.lock().state.fetch_status == FetchStatus::Fetching
    }

    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.inner.lock().state.is_stale(stale_time)
    }

    /// Returns `true` if an enabled observer is attached.
    pub fn is_active(&self) -> bool {
        self.inner.lock().observers.values().any(|enabled| *enabled)
    }

    /// Returns `true` if any observer is attached.
    pub fn has_observers(&self) -> bool {
        !self.inner.lock().observers.is_empty()
    }

    pub(crate) fn add_observer(&self, observer: ObserverId, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.observers.insert(observer, enabled);
        inner.unobserved_since = None;
    }

    pub(crate) fn remove_observer(&self, observer: ObserverId) {
        let mut inner = self.inner.lock();
        if inner.observers.remove(&observer).is_some() && inner.observers.is_empty() {
            inner.unobserved_since = Some(Instant::now());
        }
    }

    /// `true` once the query was dropped from its cache.
    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Collectable: no observers for at least `cache_time` and not fetching.
    pub fn should_gc(&self, cache_time: Duration) -> bool {
        let inner = self.inner.lock();
        inner.state.fetch_status == FetchStatus::Idle
            && inner
                .unobserved_since
                .is_some_and(|since| since.elapsed() >= cache_time)
    }

    pub fn subscribe(&self, listener: impl Fn(&()) + Send + Sync + 'static) -> ListenerId {
        self.events.on(listener)
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        self.events.off(listener);
    }

    /// Starts a fetch, or joins the one already running.
    ///
    /// With `options` the query adopts them first. A running fetch is reused
    /// unless `request.cancel_refetch` is set and the query already has data,
    /// in which case it is cancelled and a new one starts.
    pub fn fetch(
        self: &Arc<Self>,
        options: Option<&QueryOptions<T>>,
        request: FetchRequest,
    ) -> FetchFuture<T> {
        let mut inner = self.inner.lock();
        if let Some(options) = options {
            if options.query_fn().is_some() || inner.options.query_fn().is_none() {
                inner.options = options.clone();
            }
        }

        if let Some(in_flight) = inner.in_flight.take() {
            if in_flight.handle.is_finished() || (request.cancel_refetch && inner.state.data.is_some())
            {
                trace!(query = %self.hash, "cancelling running fetch for a refetch");
                in_flight.handle.cancel();
            } else {
                let future = in_flight.future.clone();
                inner.in_flight = Some(in_flight);
                return future;
            }
        }

        let Some(query_fn) = inner.options.query_fn().cloned() else {
            warn!(query = %self.hash, "fetch requested without a query function");
            return failed(QueryError::MissingQueryFn(self.hash.clone()));
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(query = %self.hash, "fetch requested outside of a Tokio runtime");
            return failed(QueryError::FetchError(
                "no Tokio runtime available".to_string(),
            ));
        };

        inner.next_fetch += 1;
        let fetch_id = inner.next_fetch;
        let retry = inner.options.retry.unwrap_or(0);
        let retry_delay = inner.options.retry_delay.unwrap_or_default();

        inner.state.fetch_status = FetchStatus::Fetching;
        inner.state.fetch_failure_count = 0;
        inner.state.fetch_direction = request.direction;
        if inner.state.data_updated_at.is_none() {
            inner.state.error = None;
            inner.state.status = QueryStatus::Pending;
        }
        inner.revision += 1;

        let token = CancellationToken::new();
        let context = FetchContext {
            query_key: self.key.clone(),
            direction: request.direction,
            data: inner.state.data.clone(),
            cancellation: token.clone(),
        };

        let (tx, rx) = oneshot::channel();
        let query = Arc::clone(self);
        let task_token = token.clone();
        let join = runtime.spawn(async move {
            let result = tokio::select! {
                () = task_token.cancelled() => Err(QueryError::Cancelled),
                result = query.run(fetch_id, query_fn, context, retry, retry_delay) => result,
            };
            query.settle(fetch_id, &result);
            let _ = tx.send(result);
        });

        let future = async move { rx.await.unwrap_or(Err(QueryError::Cancelled)) }
            .boxed()
            .shared();
        inner.in_flight = Some(InFlight {
            id: fetch_id,
            handle: FetchHandle::new(token, join),
            future: future.clone(),
        });
        drop(inner);

        debug!(query = %self.hash, fetch = fetch_id, "fetch started");
        self.events.emit(&());
        future
    }

    async fn run(
        &self,
        fetch_id: u64,
        query_fn: QueryFn<T>,
        context: FetchContext<T>,
        retry: u32,
        retry_delay: RetryDelay,
    ) -> Result<T, QueryError> {
        let mut failures = 0;
        loop {
            match query_fn(context.clone()).await {
                Ok(data) => return Ok(data),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    failures += 1;
                    if failures > retry {
                        return Err(error);
                    }
                    trace!(query = %self.hash, failures, %error, "retrying fetch");
                    self.record_failure(fetch_id, failures);
                    tokio::time::sleep(retry_delay.for_failures(failures)).await;
                }
            }
        }
    }

    fn record_failure(&self, fetch_id: u64, failures: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.in_flight.as_ref().map(|f| f.id) != Some(fetch_id) {
                return;
            }
            inner.state.fetch_failure_count = failures;
            inner.revision += 1;
        }
        self.events.emit(&());
    }

    fn settle(&self, fetch_id: u64, result: &Result<T, QueryError>) {
        {
            let mut inner = self.inner.lock();
            if inner.in_flight.as_ref().map(|f| f.id) != Some(fetch_id) {
                trace!(query = %self.hash, fetch = fetch_id, "ignoring result of a superseded fetch");
                return;
            }
            inner.in_flight = None;
            let now = Instant::now();
            let state = &mut inner.state;
            match result {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.data_updated_at = Some(now);
                    state.data_update_count += 1;
                    state.error = None;
                    state.status = QueryStatus::Success;
                    state.fetch_failure_count = 0;
                    state.is_invalidated = false;
                }
                Err(QueryError::Cancelled) => {}
                Err(error) => {
                    state.error = Some(error.clone());
                    state.error_updated_at = Some(now);
                    state.error_update_count += 1;
                    state.fetch_failure_count += 1;
                    state.status = QueryStatus::Error;
                }
            }
            state.fetch_status = FetchStatus::Idle;
            state.fetch_direction = None;
            inner.revision += 1;
        }
        debug!(query = %self.hash, fetch = fetch_id, ok = result.is_ok(), "fetch finished");
        self.events.emit(&());
    }

    /// Writes data directly, as if a fetch had returned it.
    pub fn set_data(&self, data: T) {
        {
            let mut inner = self.inner.lock();
            let state = &mut inner.state;
            state.data = Some(data);
            state.data_updated_at = Some(Instant::now());
            state.data_update_count += 1;
            state.error = None;
            state.status = QueryStatus::Success;
            state.fetch_failure_count = 0;
            state.is_invalidated = false;
            inner.revision += 1;
        }
        self.events.emit(&());
    }

    /// Cancels a running fetch and reverts to idle. Waiters get
    /// [`QueryError::Cancelled`].
    pub fn cancel(&self) {
        if self.cancel_silently() {
            self.events.emit(&());
        }
    }

    fn cancel_silently(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(in_flight) = inner.in_flight.take() else {
            return false;
        };
        in_flight.handle.cancel();
        inner.state.fetch_status = FetchStatus::Idle;
        inner.state.fetch_direction = None;
        inner.revision += 1;
        true
    }

    /// Marks the data stale so the next mount or refetch fetches again.
    pub fn invalidate(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_invalidated {
                return;
            }
            inner.state.is_invalidated = true;
            inner.revision += 1;
        }
        self.events.emit(&());
    }

    /// Drops data and error and returns to the initial state.
    pub fn reset(&self) {
        self.cancel_silently();
        {
            let mut inner = self.inner.lock();
            inner.state = QueryState::initial(inner.options.initial_data.clone());
            inner.revision += 1;
        }
        debug!(query = %self.hash, "query reset");
        self.events.emit(&());
    }

    /// Marks the query removed and cancels its fetch. Listeners are told so
    /// that attached observers can move on to a replacement.
    pub(crate) fn destroy(&self) {
        self.cancel_silently();
        self.inner.lock().removed = true;
        self.events.emit(&());
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

fn failed<T>(error: QueryError) -> FetchFuture<T>
where
    T: Clone + Send + 'static,
{
    futures::future::ready(Err(error)).boxed().shared()
}
