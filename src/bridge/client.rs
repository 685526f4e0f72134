use std::sync::{Arc, LazyLock};

use crate::error::AtomError;
use crate::query::QueryClient;
use crate::store::{Atom, Getter, Store};

/// Picks the client a cell talks to; may read atoms.
pub type ClientAccessor = Arc<dyn Fn(&Getter<'_>) -> Result<QueryClient, AtomError> + Send + Sync>;

static DEFAULT_CLIENT: LazyLock<QueryClient> = LazyLock::new(QueryClient::new);

static QUERY_CLIENT: LazyLock<Atom<QueryClient>> =
    LazyLock::new(|| Atom::new(DEFAULT_CLIENT.clone()).with_label("query_client"));

static IS_RESTORING: LazyLock<Atom<bool>> =
    LazyLock::new(|| Atom::new(false).with_label("is_restoring"));

/// The process-wide client used when nothing else is provided.
pub fn default_query_client() -> QueryClient {
    DEFAULT_CLIENT.clone()
}

/// Atom holding the client of a store. Starts as [`default_query_client`].
pub fn query_client_atom() -> Atom<QueryClient> {
    QUERY_CLIENT.clone()
}

/// Set while cached state is being restored; suspensions are skipped and
/// fetch status reads as idle.
pub fn is_restoring_atom() -> Atom<bool> {
    IS_RESTORING.clone()
}

/// Makes every cell of `store` that uses the default accessor talk to `client`.
pub fn provide_query_client(store: &Store, client: QueryClient) {
    store.set(&QUERY_CLIENT, client);
}

/// Accessor reading [`query_client_atom`].
pub fn default_client_accessor() -> ClientAccessor {
    Arc::new(|get| get.get(&QUERY_CLIENT))
}

pub(crate) fn resolve_client(accessor: Option<ClientAccessor>) -> ClientAccessor {
    accessor.unwrap_or_else(default_client_accessor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_is_shared() {
        assert_eq!(default_query_client(), default_query_client());

        let store = Store::new();
        assert_eq!(store.get(&query_client_atom()).ok(), Some(default_query_client()));
    }

    #[test]
    fn test_provided_client_is_scoped_to_store() {
        let store = Store::new();
        let other = Store::new();
        let client = QueryClient::new();

        provide_query_client(&store, client.clone());

        assert_eq!(store.get(&query_client_atom()).ok(), Some(client));
        assert_eq!(other.get(&query_client_atom()).ok(), Some(default_query_client()));
    }
}
