//! Binds query engine observers to atoms.
//!
//! Every cell built by [`crate::atoms`] runs on the same machinery:
//!   - a [`ClientAccessor`] picks the [`QueryClient`](crate::query::QueryClient);
//!   - the options are resolved for the variant and handed to an observer
//!     cached per cell, store and client, reused across reads;
//!   - while the cell is mounted, the observer's pushed snapshots are written
//!     into the store, which applies them once it is idle;
//!   - each read projects the observer's optimistic result: it may suspend,
//!     throw the query error or return the result;
//!   - writes dispatch actions. A force refetch replaces the observer.

mod action;
mod client;
mod contract;
mod engine;
mod observer_cache;
mod projector;
mod reset_boundary;
mod resolver;
mod subscription;

pub use action::{InfiniteQueryAction, MutateFuture, QueryAction, RefetchFuture};
pub use client::{
    ClientAccessor, default_client_accessor, default_query_client, is_restoring_atom,
    provide_query_client, query_client_atom,
};
pub use contract::{EngineObserver, EngineQueryObserver, SnapshotListener};
pub use reset_boundary::{QueryErrorResetBoundary, error_reset_atom};
pub use resolver::{OptionsFn, SUSPENSE_STALE_TIME, options_fn};

pub(crate) use client::resolve_client;
pub(crate) use engine::{MutationEngine, QueryEngine, next_push};
pub(crate) use resolver::VariantPolicy;
