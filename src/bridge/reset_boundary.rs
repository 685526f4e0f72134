use std::sync::LazyLock;

use crate::store::{Atom, Store};

static ERROR_RESET: LazyLock<Atom<bool>> =
    LazyLock::new(|| Atom::new(false).with_label("error_reset"));

/// `true` between a boundary reset and the next mount of a query cell.
pub fn error_reset_atom() -> Atom<bool> {
    ERROR_RESET.clone()
}

/// Coordinates retrying after an error was thrown from a query cell.
///
/// Cells that suspend or throw normally do not refetch an errored query when
/// they are read again. After [`reset`](Self::reset) they do, until a query
/// cell mounts and clears the flag.
#[derive(Debug, Clone)]
pub struct QueryErrorResetBoundary {
    store: Store,
}

impl QueryErrorResetBoundary {
    /// A boundary over the query cells of `store`.
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Lets the next read of an errored cell refetch instead of throwing the
    /// same error again.
    pub fn reset(&self) {
        self.store.set(&ERROR_RESET, true);
    }

    /// Withdraws a reset that no cell has consumed yet.
    pub fn clear_reset(&self) {
        self.store.set(&ERROR_RESET, false);
    }

    /// `true` after [`reset`](Self::reset) until a query cell mounts or the
    /// reset is cleared.
    pub fn is_reset(&self) -> bool {
        self.store.get(&ERROR_RESET).unwrap_or(false)
    }
}
