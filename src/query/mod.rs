//! The query engine: cached async queries, observers and mutations.
//!
//! A [`QueryClient`] owns a [`QueryCache`] of [`Query`] entries, one per key
//! and data type. Observers attach to a query, fetch it when needed and push a
//! [`QueryObserverResult`] to their subscribers whenever it changes. Concurrent
//! fetches of one query share a single in-flight request.
//!
//! # Example
//!
//! ```rust
//! use query_atoms::query::{QueryClient, QueryObserver, QueryOptions, RefetchOptions};
//! use query_atoms::query_key;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = QueryClient::new();
//! let observer = QueryObserver::new(
//!     &client,
//!     QueryOptions::new(query_key!["answer"], |_ctx| async { Ok(42) }),
//! );
//!
//! let result = observer.refetch(RefetchOptions::default()).await;
//! assert_eq!(result.data, Some(42));
//! # }
//! ```

mod cache;
mod client;
mod config;
mod infinite;
mod key;
mod mutation;
mod mutation_cache;
mod observer;
mod options;
mod result;
mod state;

pub use cache::QueryCache;
pub use client::{ClientId, QueryClient};
pub use config::{QueryConfig, RetryDelay};
pub use infinite::{
    InfiniteData, InfiniteQueryObserver, InfiniteQueryObserverResult, InfiniteQueryOptions,
    PageContext, PageFn, PageParamFn,
};
pub use key::{KeySegment, QueryFilters, QueryKey, QueryTypeFilter};
pub use mutation::{
    MutateOptions, MutationFn, MutationObserver, MutationObserverResult, MutationOptions,
};
pub use mutation_cache::{
    MutationCache, MutationCacheEvent, MutationFilters, MutationId, MutationState, MutationStatus,
};
pub use observer::{ObserverId, QueryObserver, RefetchOptions};
pub use options::{FetchContext, Placeholder, QueryFn, QueryOptions, ThrowOnError};
pub use result::QueryObserverResult;
pub use state::{
    FetchDirection, FetchFuture, FetchRequest, FetchStatus, Query, QueryState, QueryStatus,
};
