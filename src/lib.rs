//! # query-atoms
//!
//! Async query and mutation state exposed as dependency-tracked atoms.
//!
//! The crate has two halves joined by a bridge:
//!
//! - [`query`]: a query engine. A [`QueryClient`](query::QueryClient) caches
//!   fetched data per key, deduplicates concurrent fetches, retries failures
//!   and tracks staleness. Observers watch a query and push results.
//! - [`store`]: atoms and the [`Store`](store::Store) that evaluates them.
//!   Derived atoms track what they read and recompute when it changes. A read
//!   may suspend until data is available or throw an error.
//! - [`bridge`] binds one to the other, and [`atoms`] builds the cells users
//!   work with on top of it.
//!
//! ## Example
//!
//! ```rust
//! use query_atoms::prelude::*;
//! use query_atoms::query_key;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let user_id = Atom::new(1_u32);
//! let user = atom_with_suspense_query(
//!     {
//!         let user_id = user_id.clone();
//!         move |get| {
//!             let id = get.get(&user_id)?;
//!             Ok(QueryOptions::new(query_key!["user", id], move |_ctx| async move {
//!                 Ok(format!("user #{id}"))
//!             }))
//!         }
//!     },
//!     None,
//! );
//!
//! let store = Store::new();
//! let result = store.get_async(&user).await.unwrap();
//! assert_eq!(result.data.as_deref(), Some("user #1"));
//! # }
//! ```

pub mod atoms;
pub mod bridge;
pub mod emitter;
pub mod error;
pub mod prelude;
pub mod query;
pub mod store;

pub use error::{AtomError, QueryError};
