//! Query, infinite query and mutation cells.
//!
//! Every constructor takes an options function, which may read other atoms,
//! and an optional [`ClientAccessor`](crate::bridge::ClientAccessor). Without
//! one the cell uses [`query_client_atom`](crate::bridge::query_client_atom).
//!
//! | Constructor | Reads | Writes |
//! |---|---|---|
//! | [`atom_with_query`] | the result, never suspends | [`QueryAction`](crate::bridge::QueryAction) |
//! | [`atom_with_suspense_query`] | the result once there is data | [`QueryAction`](crate::bridge::QueryAction) |
//! | [`atom_with_infinite_query`] | the loaded pages | [`InfiniteQueryAction`](crate::bridge::InfiniteQueryAction) |
//! | [`atom_with_mutation`] | the latest mutation | read-only |
//! | [`atoms_with_query`] | data and status cells | [`QueryAction`](crate::bridge::QueryAction) |
//! | [`atoms_with_query_async`] | the same, once async options resolve | [`QueryAction`](crate::bridge::QueryAction) |

mod infinite;
mod mutation;
mod pair;
mod query;

pub use infinite::{InfiniteQueryAtom, atom_with_infinite_query, atom_with_suspense_infinite_query};
pub use mutation::{
    MutationAtomResult, MutationStateOptions, atom_with_mutation, atom_with_mutation_state,
};
pub use pair::{
    InfiniteQueryDataAtom, InfiniteQueryStatusAtom, MutationDataAtom, MutationStatusAtom,
    QueryDataAtom, QueryStatusAtom, atoms_with_infinite_query, atoms_with_mutation,
    atoms_with_query, atoms_with_query_async,
};
pub use query::{
    QueryAtom, atom_with_queries, atom_with_queries_combined, atom_with_query,
    atom_with_suspense_query,
};
