//! Infinite queries: paged data accumulated in one query.
//!
//! An infinite query stores an [`InfiniteData`] holding every loaded page and
//! the parameter each page was fetched with. Fetching the next or previous page
//! appends or prepends one page; a plain refetch reloads every loaded page in
//! order, deriving each parameter from the page before it.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::emitter::ListenerId;
use crate::error::QueryError;

use super::client::QueryClient;
use super::config::RetryDelay;
use super::key::QueryKey;
use super::observer::{QueryObserver, RefetchOptions};
use super::options::{FetchContext, Placeholder, QueryFn, QueryOptions, ThrowOnError};
use super::result::QueryObserverResult;
use super::state::{FetchDirection, FetchRequest, Query};

/// Pages loaded so far, oldest first, with their page parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfiniteData<T, P> {
    pub pages: Vec<T>,
    pub page_params: Vec<P>,
}

impl<T, P> InfiniteData<T, P> {
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn last(&self) -> Option<(&T, &P)> {
        self.pages.last().zip(self.page_params.last())
    }

    fn first(&self) -> Option<(&T, &P)> {
        self.pages.first().zip(self.page_params.first())
    }

    fn push_back(&mut self, page: T, param: P, max_pages: Option<usize>) {
        self.pages.push(page);
        self.page_params.push(param);
        if max_pages.is_some_and(|max| self.pages.len() > max) {
            self.pages.remove(0);
            self.page_params.remove(0);
        }
    }

    fn push_front(&mut self, page: T, param: P, max_pages: Option<usize>) {
        self.pages.insert(0, page);
        self.page_params.insert(0, param);
        if max_pages.is_some_and(|max| self.pages.len() > max) {
            self.pages.pop();
            self.page_params.pop();
        }
    }
}

impl<T, P> Default for InfiniteData<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a page function is called with.
#[derive(Debug, Clone)]
pub struct PageContext<P> {
    pub query_key: QueryKey,
    pub page_param: P,
    pub direction: FetchDirection,
    pub cancellation: CancellationToken,
}

/// Boxed page function.
pub type PageFn<T, P> =
    Arc<dyn Fn(PageContext<P>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Derives a neighbouring page parameter from an edge page and its parameter.
/// `None` means there is no such page.
pub type PageParamFn<T, P> = Arc<dyn Fn(&T, &P) -> Option<P> + Send + Sync>;

/// Options for an infinite query.
pub struct InfiniteQueryOptions<T, P> {
    /// Options of the underlying query, except its query function.
    pub base: QueryOptions<InfiniteData<T, P>>,
    page_fn: PageFn<T, P>,
    pub initial_page_param: P,
    get_next_page_param: PageParamFn<T, P>,
    get_previous_page_param: Option<PageParamFn<T, P>>,
    /// Drop pages from the other end once more than this many are loaded.
    pub max_pages: Option<usize>,
}

impl<T, P> InfiniteQueryOptions<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut, N>(
        query_key: impl Into<QueryKey>,
        initial_page_param: P,
        page_fn: F,
        get_next_page_param: N,
    ) -> Self
    where
        F: Fn(PageContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
        N: Fn(&T, &P) -> Option<P> + Send + Sync + 'static,
    {
        Self {
            base: QueryOptions::keyed(query_key),
            page_fn: Arc::new(move |context: PageContext<P>| page_fn(context).boxed()),
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            get_previous_page_param: None,
            max_pages: None,
        }
    }

    #[must_use]
    pub fn with_previous_page_param<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &P) -> Option<P> + Send + Sync + 'static,
    {
        self.get_previous_page_param = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub const fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.base.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.base.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.base.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.base.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub fn with_initial_data(mut self, data: InfiniteData<T, P>) -> Self {
        self.base.initial_data = Some(data);
        self
    }

    #[must_use]
    pub fn with_placeholder(mut self, placeholder: Placeholder<InfiniteData<T, P>>) -> Self {
        self.base.placeholder = placeholder;
        self
    }

    #[must_use]
    pub fn with_throw_on_error(
        mut self,
        throw_on_error: impl Into<ThrowOnError<InfiniteData<T, P>>>,
    ) -> Self {
        self.base.throw_on_error = throw_on_error.into();
        self
    }

    #[must_use]
    pub fn with_suspense(mut self, suspense: bool) -> Self {
        self.base.suspense = suspense;
        self
    }

    pub fn has_next_page(&self, data: &InfiniteData<T, P>) -> bool {
        data.last()
            .is_some_and(|(page, param)| (self.get_next_page_param)(page, param).is_some())
    }

    pub fn has_previous_page(&self, data: &InfiniteData<T, P>) -> bool {
        match (&self.get_previous_page_param, data.first()) {
            (Some(previous), Some((page, param))) => previous(page, param).is_some(),
            _ => false,
        }
    }

    /// The underlying query options, with a query function that loads pages.
    pub fn query_options(&self) -> QueryOptions<InfiniteData<T, P>> {
        self.base.clone().with_boxed_query_fn(self.page_loader())
    }

    fn page_loader(&self) -> QueryFn<InfiniteData<T, P>> {
        let page_fn = Arc::clone(&self.page_fn);
        let next = Arc::clone(&self.get_next_page_param);
        let previous = self.get_previous_page_param.clone();
        let initial = self.initial_page_param.clone();
        let max_pages = self.max_pages;

        Arc::new(move |context: FetchContext<InfiniteData<T, P>>| {
            let page_fn = Arc::clone(&page_fn);
            let next = Arc::clone(&next);
            let previous = previous.clone();
            let initial = initial.clone();
            async move {
                let FetchContext {
                    query_key,
                    direction,
                    data,
                    cancellation,
                } = context;
                let mut data = data.unwrap_or_default();
                let fetch_page = |page_param: P, direction: FetchDirection| {
                    page_fn(PageContext {
                        query_key: query_key.clone(),
                        page_param,
                        direction,
                        cancellation: cancellation.clone(),
                    })
                };

                match direction {
                    Some(FetchDirection::Forward) if !data.is_empty() => {
                        let Some(param) = data.last().and_then(|(page, param)| next(page, param))
                        else {
                            return Ok(data);
                        };
                        let page = fetch_page(param.clone(), FetchDirection::Forward).await?;
                        data.push_back(page, param, max_pages);
                        Ok(data)
                    }
                    Some(FetchDirection::Backward) if !data.is_empty() => {
                        let param = match (&previous, data.first()) {
                            (Some(previous), Some((page, param))) => previous(page, param),
                            _ => None,
                        };
                        let Some(param) = param else {
                            return Ok(data);
                        };
                        let page = fetch_page(param.clone(), FetchDirection::Backward).await?;
                        data.push_front(page, param, max_pages);
                        Ok(data)
                    }
                    _ => {
                        let count = data.len().max(1);
                        let mut param = data.page_params.first().cloned().unwrap_or(initial);
                        let mut fresh = InfiniteData::new();
                        for index in 0..count {
                            if index > 0 {
                                match fresh.last().and_then(|(page, param)| next(page, param)) {
                                    Some(next_param) => param = next_param,
                                    None => break,
                                }
                            }
                            let page = fetch_page(param.clone(), FetchDirection::Forward).await?;
                            fresh.pages.push(page);
                            fresh.page_params.push(param.clone());
                        }
                        Ok(fresh)
                    }
                }
            }
            .boxed()
        })
    }
}

impl<T: Clone, P: Clone> Clone for InfiniteQueryOptions<T, P> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            page_fn: Arc::clone(&self.page_fn),
            initial_page_param: self.initial_page_param.clone(),
            get_next_page_param: Arc::clone(&self.get_next_page_param),
            get_previous_page_param: self.get_previous_page_param.clone(),
            max_pages: self.max_pages,
        }
    }
}

impl<T, P: fmt::Debug> fmt::Debug for InfiniteQueryOptions<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("base", &self.base)
            .field("initial_page_param", &self.initial_page_param)
            .field("has_previous", &self.get_previous_page_param.is_some())
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

/// Result of an infinite query observer.
#[derive(Debug, Clone)]
pub struct InfiniteQueryObserverResult<T, P> {
    pub result: QueryObserverResult<InfiniteData<T, P>>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub is_fetching_next_page: bool,
    pub is_fetching_previous_page: bool,
}

impl<T, P> InfiniteQueryObserverResult<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn new(
        result: QueryObserverResult<InfiniteData<T, P>>,
        options: &InfiniteQueryOptions<T, P>,
    ) -> Self {
        let (has_next_page, has_previous_page) = result.data.as_ref().map_or((false, false), |data| {
            (options.has_next_page(data), options.has_previous_page(data))
        });
        let fetching = |direction| result.is_fetching() && result.fetch_direction == Some(direction);
        Self {
            has_next_page,
            has_previous_page,
            is_fetching_next_page: fetching(FetchDirection::Forward),
            is_fetching_previous_page: fetching(FetchDirection::Backward),
            result,
        }
    }
}

impl<T, P> Deref for InfiniteQueryObserverResult<T, P> {
    type Target = QueryObserverResult<InfiniteData<T, P>>;

    fn deref(&self) -> &Self::Target {
        &self.result
    }
}

/// Observes an infinite query and loads further pages on request.
pub struct InfiniteQueryObserver<T, P> {
    observer: Arc<QueryObserver<InfiniteData<T, P>>>,
    options: Arc<Mutex<InfiniteQueryOptions<T, P>>>,
}

impl<T, P> InfiniteQueryObserver<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<T, P>) -> Arc<Self> {
        let observer = QueryObserver::new(client, options.query_options());
        Arc::new(Self {
            observer,
            options: Arc::new(Mutex::new(options)),
        })
    }

    pub fn client(&self) -> &QueryClient {
        self.observer.client()
    }

    pub fn set_options(&self, options: InfiniteQueryOptions<T, P>) {
        let query_options = options.query_options();
        *self.options.lock() = options;
        self.observer.set_options(query_options);
    }

    pub fn options(&self) -> InfiniteQueryOptions<T, P> {
        self.options.lock().clone()
    }

    fn wrap(&self, result: QueryObserverResult<InfiniteData<T, P>>) -> InfiniteQueryObserverResult<T, P> {
        InfiniteQueryObserverResult::new(result, &self.options.lock())
    }

    pub fn current_result(&self) -> InfiniteQueryObserverResult<T, P> {
        self.wrap(self.observer.current_result())
    }

    pub fn current_query(&self) -> Arc<Query<InfiniteData<T, P>>> {
        self.observer.current_query()
    }

    pub fn revision(&self) -> u64 {
        self.observer.revision()
    }

    pub fn optimistic_result(
        &self,
        options: &InfiniteQueryOptions<T, P>,
    ) -> InfiniteQueryObserverResult<T, P> {
        let result = self.observer.optimistic_result(&options.query_options());
        InfiniteQueryObserverResult::new(result, options)
    }

    pub fn fetch_optimistic(
        &self,
        options: &InfiniteQueryOptions<T, P>,
    ) -> BoxFuture<'static, InfiniteQueryObserverResult<T, P>> {
        let options = options.clone();
        let fetch = self.observer.fetch_optimistic(&options.query_options());
        async move { InfiniteQueryObserverResult::new(fetch.await, &options) }.boxed()
    }

    pub fn fetch_next_page(&self) -> BoxFuture<'static, InfiniteQueryObserverResult<T, P>> {
        self.fetch_page(FetchRequest::page(FetchDirection::Forward))
    }

    pub fn fetch_previous_page(&self) -> BoxFuture<'static, InfiniteQueryObserverResult<T, P>> {
        self.fetch_page(FetchRequest::page(FetchDirection::Backward))
    }

    /// Reloads every loaded page.
    pub fn refetch(&self, options: RefetchOptions) -> BoxFuture<'static, InfiniteQueryObserverResult<T, P>> {
        let refetch = self.observer.refetch(options);
        let options = Arc::clone(&self.options);
        async move { InfiniteQueryObserverResult::new(refetch.await, &options.lock()) }.boxed()
    }

    fn fetch_page(&self, request: FetchRequest) -> BoxFuture<'static, InfiniteQueryObserverResult<T, P>> {
        let fetch = self.observer.execute_fetch(request);
        let observer = Arc::clone(&self.observer);
        let options = Arc::clone(&self.options);
        async move {
            let _ = fetch.await;
            observer.update_result();
            InfiniteQueryObserverResult::new(observer.current_result(), &options.lock())
        }
        .boxed()
    }

    pub fn remove(&self) {
        self.observer.remove();
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&InfiniteQueryObserverResult<T, P>) + Send + Sync + 'static,
    ) -> ListenerId {
        let options = Arc::clone(&self.options);
        self.observer.subscribe(move |result| {
            let result = InfiniteQueryObserverResult::new(result.clone(), &options.lock());
            listener(&result);
        })
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        self.observer.unsubscribe(listener);
    }
}

impl<T, P> fmt::Debug for InfiniteQueryObserver<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryObserver")
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}
