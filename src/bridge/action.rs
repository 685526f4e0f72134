use futures::future::BoxFuture;

use crate::error::QueryError;
use crate::query::RefetchOptions;

/// Resolves with the settled snapshot, `None` after a force refetch.
pub type RefetchFuture<R> = BoxFuture<'static, Result<Option<R>, QueryError>>;

/// Resolves with the mutation's data, `None` if it failed. The failure itself
/// shows up in the cell's result.
pub type MutateFuture<T> = BoxFuture<'static, Option<T>>;

/// Actions accepted by query cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    /// Refetch through the cached observer, or with `force` replace the
    /// observer and start over from a clean state.
    Refetch { force: bool, options: RefetchOptions },
}

impl QueryAction {
    /// Refetches the current query with default [`RefetchOptions`].
    pub fn refetch() -> Self {
        Self::refetch_with(RefetchOptions::default())
    }

    /// Refetches the current query with `options`.
    pub const fn refetch_with(options: RefetchOptions) -> Self {
        Self::Refetch { force: false, options }
    }

    /// Drops the cell's observer and query, then loads again from scratch.
    /// Readers suspend as on a first load and the write resolves with `None`.
    pub fn force_refetch() -> Self {
        Self::Refetch {
            force: true,
            options: RefetchOptions::default(),
        }
    }

    /// `true` when the action replaces the observer instead of using it.
    pub const fn is_force(&self) -> bool {
        matches!(self, Self::Refetch { force: true, .. })
    }

    pub const fn options(&self) -> RefetchOptions {
        match self {
            Self::Refetch { options, .. } => *options,
        }
    }
}

/// Actions accepted by infinite query cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfiniteQueryAction {
    /// Refetch every loaded page, or with `force` start over from a fresh
    /// observer.
    Refetch { force: bool, options: RefetchOptions },
    FetchNextPage,
    FetchPreviousPage,
}

impl InfiniteQueryAction {
    /// Refetches all loaded pages with default [`RefetchOptions`].
    pub fn refetch() -> Self {
        Self::refetch_with(RefetchOptions::default())
    }

    pub const fn refetch_with(options: RefetchOptions) -> Self {
        Self::Refetch { force: false, options }
    }

    /// Drops the cell's observer and query and loads the first page again.
    pub fn force_refetch() -> Self {
        Self::Refetch {
            force: true,
            options: RefetchOptions::default(),
        }
    }

    /// `true` when the action replaces the observer instead of using it.
    pub const fn is_force(&self) -> bool {
        matches!(self, Self::Refetch { force: true, .. })
    }

    /// Options of a refetch; page fetches use the defaults.
    pub fn options(&self) -> RefetchOptions {
        match self {
            Self::Refetch { options, .. } => *options,
            Self::FetchNextPage | Self::FetchPreviousPage => RefetchOptions::default(),
        }
    }
}

impl From<QueryAction> for InfiniteQueryAction {
    fn from(action: QueryAction) -> Self {
        match action {
            QueryAction::Refetch { force, options } => Self::Refetch { force, options },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_flag() {
        assert!(!QueryAction::refetch().is_force());
        assert!(QueryAction::force_refetch().is_force());
        assert!(!InfiniteQueryAction::FetchNextPage.is_force());
        assert!(InfiniteQueryAction::from(QueryAction::force_refetch()).is_force());
    }

    #[test]
    fn test_refetch_options_carry_over() {
        let options = RefetchOptions::default().with_cancel_refetch(false);
        let action = QueryAction::refetch_with(options);
        assert!(!action.is_force());
        assert!(!action.options().cancel_refetch);
        assert_eq!(InfiniteQueryAction::from(action).options(), options);
        assert!(InfiniteQueryAction::FetchNextPage.options().throw_on_error);
    }
}
