use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

use super::config::RetryDelay;
use super::key::QueryKey;
use super::state::{FetchDirection, Query};

/// Boxed query function.
pub type QueryFn<T> =
    Arc<dyn Fn(FetchContext<T>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Everything a query function is called with.
#[derive(Clone)]
pub struct FetchContext<T> {
    pub query_key: QueryKey,
    /// Page direction of an infinite query fetch; `None` for a full fetch.
    pub direction: Option<FetchDirection>,
    /// Data currently held by the query.
    pub data: Option<T>,
    /// Cancelled when the fetch is abandoned.
    pub cancellation: CancellationToken,
}

impl<T> fmt::Debug for FetchContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("query_key", &self.query_key)
            .field("direction", &self.direction)
            .field("has_data", &self.data.is_some())
            .finish_non_exhaustive()
    }
}

/// Data shown while a query has none of its own.
#[derive(Debug, Clone, Default)]
pub enum Placeholder<T> {
    #[default]
    None,
    Value(T),
    /// Keep showing the data of the previously observed query.
    KeepPrevious,
}

type ThrowPredicate<T> = Arc<dyn Fn(&QueryError, &Query<T>) -> bool + Send + Sync>;

/// Decides whether an error result is thrown from an atom read.
pub enum ThrowOnError<T> {
    Never,
    Always,
    When(ThrowPredicate<T>),
}

impl<T> ThrowOnError<T> {
    /// Throws when `predicate` returns `true` for the error and its query.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&QueryError, &Query<T>) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(predicate))
    }

    pub fn evaluate(&self, error: &QueryError, query: &Query<T>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(error, query),
        }
    }
}

impl<T> Default for ThrowOnError<T> {
    fn default() -> Self {
        Self::Never
    }
}

impl<T> Clone for ThrowOnError<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Never => Self::Never,
            Self::Always => Self::Always,
            Self::When(predicate) => Self::When(Arc::clone(predicate)),
        }
    }
}

impl<T> From<bool> for ThrowOnError<T> {
    fn from(value: bool) -> Self {
        if value { Self::Always } else { Self::Never }
    }
}

impl<T> fmt::Debug for ThrowOnError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Options for a single query.
///
/// Unset durations and retry counts fall back to the client's
/// [`QueryConfig`](super::QueryConfig) when the options are resolved by
/// [`QueryClient::default_query_options`](super::QueryClient::default_query_options).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use query_atoms::query::QueryOptions;
/// use query_atoms::query_key;
///
/// let options = QueryOptions::new(query_key!["user", 1], |_ctx| async { Ok("alice") })
///     .with_stale_time(Duration::from_secs(30))
///     .with_retry(0);
/// assert!(options.enabled);
/// ```
pub struct QueryOptions<T> {
    pub query_key: QueryKey,
    query_fn: Option<QueryFn<T>>,
    pub enabled: bool,
    pub stale_time: Option<Duration>,
    /// How long the query is kept once nothing observes it.
    pub cache_time: Option<Duration>,
    pub retry: Option<u32>,
    pub retry_delay: Option<RetryDelay>,
    /// Refetch an errored query without data when a new observer mounts.
    pub retry_on_mount: bool,
    /// Refetch stale data when a new observer mounts.
    pub refetch_on_mount: bool,
    pub initial_data: Option<T>,
    pub placeholder: Placeholder<T>,
    pub throw_on_error: ThrowOnError<T>,
    pub suspense: bool,
}

impl<T> QueryOptions<T>
where
    T: Send + 'static,
{
    /// Creates options for `query_key` fetched with `query_fn`.
    pub fn new<F, Fut>(query_key: impl Into<QueryKey>, query_fn: F) -> Self
    where
        F: Fn(FetchContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::keyed(query_key).with_query_fn(query_fn)
    }

    #[must_use]
    pub fn with_query_fn<F, Fut>(mut self, query_fn: F) -> Self
    where
        F: Fn(FetchContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        self.query_fn = Some(Arc::new(move |context: FetchContext<T>| query_fn(context).boxed()));
        self
    }
}

impl<T> QueryOptions<T> {
    /// Creates options without a query function, as used for cache writes.
    pub fn keyed(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn: None,
            enabled: true,
            stale_time: None,
            cache_time: None,
            retry: None,
            retry_delay: None,
            retry_on_mount: true,
            refetch_on_mount: true,
            initial_data: None,
            placeholder: Placeholder::None,
            throw_on_error: ThrowOnError::Never,
            suspense: false,
        }
    }

    pub(crate) fn with_boxed_query_fn(mut self, query_fn: QueryFn<T>) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub const fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub const fn with_retry_on_mount(mut self, retry_on_mount: bool) -> Self {
        self.retry_on_mount = retry_on_mount;
        self
    }

    #[must_use]
    pub const fn with_refetch_on_mount(mut self, refetch_on_mount: bool) -> Self {
        self.refetch_on_mount = refetch_on_mount;
        self
    }

    #[must_use]
    pub fn with_initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    #[must_use]
    pub fn with_placeholder(mut self, placeholder: Placeholder<T>) -> Self {
        self.placeholder = placeholder;
        self
    }

    #[must_use]
    pub fn with_throw_on_error(mut self, throw_on_error: impl Into<ThrowOnError<T>>) -> Self {
        self.throw_on_error = throw_on_error.into();
        self
    }

    #[must_use]
    pub const fn with_suspense(mut self, suspense: bool) -> Self {
        self.suspense = suspense;
        self
    }

    pub fn query_hash(&self) -> String {
        self.query_key.query_hash()
    }

    pub fn query_fn(&self) -> Option<&QueryFn<T>> {
        self.query_fn.as_ref()
    }

    pub(crate) fn resolved_stale_time(&self) -> Duration {
        self.stale_time.unwrap_or_default()
    }
}

impl<T: Clone> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            query_key: self.query_key.clone(),
            query_fn: self.query_fn.clone(),
            enabled: self.enabled,
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry: self.retry,
            retry_delay: self.retry_delay,
            retry_on_mount: self.retry_on_mount,
            refetch_on_mount: self.refetch_on_mount,
            initial_data: self.initial_data.clone(),
            placeholder: self.placeholder.clone(),
            throw_on_error: self.throw_on_error.clone(),
            suspense: self.suspense,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("retry", &self.retry)
            .field("retry_on_mount", &self.retry_on_mount)
            .field("suspense", &self.suspense)
            .field("throw_on_error", &self.throw_on_error)
            .finish_non_exhaustive()
    }
}
