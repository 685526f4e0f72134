use tokio::time::Instant;

use crate::error::QueryError;

use super::state::{FetchDirection, FetchStatus, QueryStatus};

/// What an observer reports about its query at one point in time.
#[derive(Debug, Clone)]
pub struct QueryObserverResult<T> {
    pub data: Option<T>,
    pub data_updated_at: Option<Instant>,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub error_update_count: u32,
    pub failure_count: u32,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub fetch_direction: Option<FetchDirection>,
    /// The data comes from a placeholder, not from the query.
    pub is_placeholder_data: bool,
    pub is_stale: bool,
    /// The query has settled at least once.
    pub is_fetched: bool,
}

impl<T> QueryObserverResult<T> {
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    pub const fn is_fetching(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Fetching)
    }

    /// Pending and fetching: the first fetch is running.
    pub const fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Fetching while data or an error is already there.
    pub const fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    pub const fn is_loading_error(&self) -> bool {
        self.is_error() && self.data.is_none()
    }

    pub const fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data.is_some()
    }

    /// Result handed out when the observer is gone before a refetch settles.
    pub(crate) const fn cancelled() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            error: Some(QueryError::Cancelled),
            error_updated_at: None,
            error_update_count: 0,
            failure_count: 0,
            status: QueryStatus::Error,
            fetch_status: FetchStatus::Idle,
            fetch_direction: None,
            is_placeholder_data: false,
            is_stale: true,
            is_fetched: false,
        }
    }

    /// Maps the data, keeping every status field.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryObserverResult<U> {
        QueryObserverResult {
            data: self.data.map(f),
            data_updated_at: self.data_updated_at,
            error: self.error,
            error_updated_at: self.error_updated_at,
            error_update_count: self.error_update_count,
            failure_count: self.failure_count,
            status: self.status,
            fetch_status: self.fetch_status,
            fetch_direction: self.fetch_direction,
            is_placeholder_data: self.is_placeholder_data,
            is_stale: self.is_stale,
            is_fetched: self.is_fetched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: QueryStatus, fetch_status: FetchStatus, data: Option<i32>) -> QueryObserverResult<i32> {
        QueryObserverResult {
            data,
            data_updated_at: None,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            failure_count: 0,
            status,
            fetch_status,
            fetch_direction: None,
            is_placeholder_data: false,
            is_stale: true,
            is_fetched: false,
        }
    }

    #[test]
    fn test_pending_states_are_distinguishable() {
        let idle = result(QueryStatus::Pending, FetchStatus::Idle, None);
        assert!(idle.is_pending());
        assert!(!idle.is_loading());

        let loading = result(QueryStatus::Pending, FetchStatus::Fetching, None);
        assert!(loading.is_loading());
        assert!(!loading.is_refetching());
    }

    #[test]
    fn test_error_kinds() {
        let loading_error = result(QueryStatus::Error, FetchStatus::Idle, None);
        assert!(loading_error.is_loading_error());
        assert!(!loading_error.is_refetch_error());

        let refetch_error = result(QueryStatus::Error, FetchStatus::Fetching, Some(1));
        assert!(refetch_error.is_refetch_error());
        assert!(refetch_error.is_refetching());
    }

    #[test]
    fn test_map_keeps_status() {
        let mapped = result(QueryStatus::Success, FetchStatus::Idle, Some(2)).map(|n| n * 10);
        assert_eq!(mapped.data, Some(20));
        assert!(mapped.is_success());
    }
}
