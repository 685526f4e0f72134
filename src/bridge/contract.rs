//! What the bridge needs from an engine observer.
//!
//! The three observer kinds of the query engine share one binding engine. The
//! traits here expose the common surface and the few places where the kinds
//! differ: how options and snapshots are nested, and which actions a cell
//! accepts.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::emitter::ListenerId;
use crate::query::{
    InfiniteData, InfiniteQueryObserver, InfiniteQueryObserverResult, InfiniteQueryOptions,
    MutationObserver, MutationObserverResult, MutationOptions, Query, QueryClient,
    QueryObserver, QueryObserverResult, QueryOptions, RefetchOptions,
};

use super::action::{InfiniteQueryAction, QueryAction};

/// Listener for pushed snapshots.
pub type SnapshotListener<R> = Box<dyn Fn(&R) + Send + Sync>;

/// An observer the bridge can create, reconfigure and subscribe to.
pub trait EngineObserver: Send + Sync + 'static {
    type Options: Clone + Send + Sync + 'static;
    type Result: Clone + Send + Sync + 'static;

    fn create(client: &QueryClient, options: Self::Options) -> Arc<Self>;

    fn set_options(&self, options: Self::Options);

    fn current_result(&self) -> Self::Result;

    /// Changes whenever a fresh read could see a different result.
    fn revision(&self) -> u64;

    fn subscribe(&self, listener: SnapshotListener<Self::Result>) -> ListenerId;

    fn unsubscribe(&self, listener: ListenerId);
}

/// An observer of a query, plain or infinite.
pub trait EngineQueryObserver: EngineObserver {
    type Data: Clone + Send + Sync + 'static;
    type Action: Send + 'static;

    fn query_options(options: &Self::Options) -> &QueryOptions<Self::Data>;

    fn query_options_mut(options: &mut Self::Options) -> &mut QueryOptions<Self::Data>;

    fn snapshot(result: &Self::Result) -> &QueryObserverResult<Self::Data>;

    fn snapshot_mut(result: &mut Self::Result) -> &mut QueryObserverResult<Self::Data>;

    fn optimistic_result(&self, options: &Self::Options) -> Self::Result;

    fn fetch_optimistic(&self, options: &Self::Options) -> BoxFuture<'static, Self::Result>;

    fn current_query(&self) -> Arc<Query<Self::Data>>;

    fn remove(&self);

    /// `true` for actions that replace the observer instead of using it.
    fn is_force(action: &Self::Action) -> bool;

    fn refetch_options(action: &Self::Action) -> RefetchOptions;

    fn dispatch(self: Arc<Self>, action: Self::Action) -> BoxFuture<'static, Self::Result>;
}

impl<T> EngineObserver for QueryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Options = QueryOptions<T>;
    type Result = QueryObserverResult<T>;

    fn create(client: &QueryClient, options: Self::Options) -> Arc<Self> {
        QueryObserver::new(client, options)
    }

    fn set_options(&self, options: Self::Options) {
        QueryObserver::set_options(self, options);
    }

    fn current_result(&self) -> Self::Result {
        QueryObserver::current_result(self)
    }

    fn revision(&self) -> u64 {
        QueryObserver::revision(self)
    }

    fn subscribe(&self, listener: SnapshotListener<Self::Result>) -> ListenerId {
        QueryObserver::subscribe(self, listener)
    }

    fn unsubscribe(&self, listener: ListenerId) {
        QueryObserver::unsubscribe(self, listener);
    }
}

impl<T> EngineQueryObserver for QueryObserver<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Data = T;
    type Action = QueryAction;

    fn query_options(options: &Self::Options) -> &QueryOptions<T> {
        options
    }

    fn query_options_mut(options: &mut Self::Options) -> &mut QueryOptions<T> {
        options
    }

    fn snapshot(result: &Self::Result) -> &QueryObserverResult<T> {
        result
    }

    fn snapshot_mut(result: &mut Self::Result) -> &mut QueryObserverResult<T> {
        result
    }

    fn optimistic_result(&self, options: &Self::Options) -> Self::Result {
        QueryObserver::optimistic_result(self, options)
    }

    fn fetch_optimistic(&self, options: &Self::Options) -> BoxFuture<'static, Self::Result> {
        QueryObserver::fetch_optimistic(self, options)
    }

    fn current_query(&self) -> Arc<Query<T>> {
        QueryObserver::current_query(self)
    }

    fn remove(&self) {
        QueryObserver::remove(self);
    }

    fn is_force(action: &QueryAction) -> bool {
        action.is_force()
    }

    fn refetch_options(action: &QueryAction) -> RefetchOptions {
        action.options()
    }

    fn dispatch(self: Arc<Self>, action: QueryAction) -> BoxFuture<'static, Self::Result> {
        match action {
            QueryAction::Refetch { options, .. } => self.refetch(options),
        }
    }
}

impl<T, P> EngineObserver for InfiniteQueryObserver<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    type Options = InfiniteQueryOptions<T, P>;
    type Result = InfiniteQueryObserverResult<T, P>;

    fn create(client: &QueryClient, options: Self::Options) -> Arc<Self> {
        InfiniteQueryObserver::new(client, options)
    }

    fn set_options(&self, options: Self::Options) {
        InfiniteQueryObserver::set_options(self, options);
    }

    fn current_result(&self) -> Self::Result {
        InfiniteQueryObserver::current_result(self)
    }

    fn revision(&self) -> u64 {
        InfiniteQueryObserver::revision(self)
    }

    fn subscribe(&self, listener: SnapshotListener<Self::Result>) -> ListenerId {
        InfiniteQueryObserver::subscribe(self, listener)
    }

    fn unsubscribe(&self, listener: ListenerId) {
        InfiniteQueryObserver::unsubscribe(self, listener);
    }
}

impl<T, P> EngineQueryObserver for InfiniteQueryObserver<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    type Data = InfiniteData<T, P>;
    type Action = InfiniteQueryAction;

    fn query_options(options: &Self::Options) -> &QueryOptions<InfiniteData<T, P>> {
        &options.base
    }

    fn query_options_mut(options: &mut Self::Options) -> &mut QueryOptions<InfiniteData<T, P>> {
        &mut options.base
    }

    fn snapshot(result: &Self::Result) -> &QueryObserverResult<InfiniteData<T, P>> {
        &result.result
    }

    fn snapshot_mut(result: &mut Self::Result) -> &mut QueryObserverResult<InfiniteData<T, P>> {
        &mut result.result
    }

    fn optimistic_result(&self, options: &Self::Options) -> Self::Result {
        InfiniteQueryObserver::optimistic_result(self, options)
    }

    fn fetch_optimistic(&self, options: &Self::Options) -> BoxFuture<'static, Self::Result> {
        InfiniteQueryObserver::fetch_optimistic(self, options)
    }

    fn current_query(&self) -> Arc<Query<InfiniteData<T, P>>> {
        InfiniteQueryObserver::current_query(self)
    }

    fn remove(&self) {
        InfiniteQueryObserver::remove(self);
    }

    fn is_force(action: &InfiniteQueryAction) -> bool {
        action.is_force()
    }

    fn refetch_options(action: &InfiniteQueryAction) -> RefetchOptions {
        action.options()
    }

    fn dispatch(self: Arc<Self>, action: InfiniteQueryAction) -> BoxFuture<'static, Self::Result> {
        match action {
            InfiniteQueryAction::Refetch { options, .. } => self.refetch(options),
            InfiniteQueryAction::FetchNextPage => self.fetch_next_page(),
            InfiniteQueryAction::FetchPreviousPage => self.fetch_previous_page(),
        }
    }
}

impl<T, V> EngineObserver for MutationObserver<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Options = MutationOptions<T, V>;
    type Result = MutationObserverResult<T, V>;

    fn create(client: &QueryClient, options: Self::Options) -> Arc<Self> {
        MutationObserver::new(client, options)
    }

    fn set_options(&self, options: Self::Options) {
        MutationObserver::set_options(self, options);
    }

    fn current_result(&self) -> Self::Result {
        MutationObserver::current_result(self)
    }

    fn revision(&self) -> u64 {
        MutationObserver::revision(self)
    }

    fn subscribe(&self, listener: SnapshotListener<Self::Result>) -> ListenerId {
        MutationObserver::subscribe(self, listener)
    }

    fn unsubscribe(&self, listener: ListenerId) {
        MutationObserver::unsubscribe(self, listener);
    }
}

/// Resolves with `Err` when the settled snapshot is an error and
/// `throw_on_error` is set.
pub(crate) fn settle<O>(
    fetch: BoxFuture<'static, O::Result>,
    throw_on_error: bool,
) -> BoxFuture<'static, Result<O::Result, crate::error::QueryError>>
where
    O: EngineQueryObserver,
{
    fetch
        .map(move |result| match O::snapshot(&result).error.clone() {
            Some(error) if throw_on_error && O::snapshot(&result).is_error() => Err(error),
            _ => Ok(result),
        })
        .boxed()
}
