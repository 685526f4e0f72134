//! Prelude module for convenient imports.
//!
//! ```
//! use query_atoms::prelude::*;
//! ```

pub use crate::atoms::{
    MutationAtomResult, MutationStateOptions, atom_with_infinite_query, atom_with_mutation,
    atom_with_mutation_state, atom_with_queries, atom_with_queries_combined, atom_with_query,
    atom_with_suspense_infinite_query, atom_with_suspense_query, atoms_with_infinite_query,
    atoms_with_mutation, atoms_with_query, atoms_with_query_async,
};
pub use crate::bridge::{
    InfiniteQueryAction, QueryAction, QueryErrorResetBoundary, provide_query_client,
    query_client_atom,
};
pub use crate::error::{AtomError, QueryError};
pub use crate::query::{
    InfiniteQueryOptions, MutateOptions, MutationOptions, QueryClient, QueryKey, QueryOptions,
    RefetchOptions,
};
pub use crate::store::{Atom, Store};
