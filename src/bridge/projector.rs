use std::sync::Arc;

use futures::FutureExt;
use tracing::trace;

use crate::error::AtomError;
use crate::query::FetchStatus;
use crate::store::Suspense;

use super::contract::EngineQueryObserver;

/// Decides what a read of a query cell returns.
///
/// The result is the observer's optimistic result for `options`, so a read
/// right after an options change already reflects the new query and a fetch
/// it is about to start. Then:
///   - a suspending query that is still pending suspends on the optimistic
///     fetch, unless state is being restored;
///   - an error result that is not refetching is thrown when the throw
///     policy says so;
///   - anything else is returned as is.
///
/// The suspension never fails. A failed fetch settles it too and the error is
/// thrown by the next read.
pub(crate) fn project<O>(
    observer: &Arc<O>,
    options: &O::Options,
    is_restoring: bool,
) -> Result<O::Result, AtomError>
where
    O: EngineQueryObserver,
{
    let mut result = observer.optimistic_result(options);
    if is_restoring {
        O::snapshot_mut(&mut result).fetch_status = FetchStatus::Idle;
    }

    let query_options = O::query_options(options);
    let snapshot = O::snapshot(&result);
    if query_options.suspense && snapshot.is_pending() && !is_restoring {
        trace!(query = %query_options.query_hash(), "suspending until the query settles");
        let fetch = observer.fetch_optimistic(options);
        return Err(AtomError::Suspended(Suspense::new(fetch.map(|_| ()))));
    }

    if snapshot.is_error() && !snapshot.is_fetching() {
        if let Some(error) = &snapshot.error {
            if query_options
                .throw_on_error
                .evaluate(error, &observer.current_query())
            {
                trace!(query = %query_options.query_hash(), %error, "throwing query error");
                return Err(AtomError::Query(error.clone()));
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::query::{QueryClient, QueryObserver, QueryOptions, RefetchOptions, ThrowOnError};
    use crate::query_key;

    fn failing(key: &str) -> QueryOptions<u8> {
        QueryOptions::new(query_key![key], |_| async {
            Err(QueryError::FetchError("down".into()))
        })
        .with_retry(0)
        .with_retry_on_mount(false)
    }

    #[tokio::test]
    async fn test_suspends_while_pending() {
        let client = QueryClient::new();
        let options = QueryOptions::new(query_key!["slow"], |_| async { Ok(7_u8) }).with_suspense(true);
        let observer = QueryObserver::new(&client, options.clone());

        let suspense = match project(&observer, &options, false) {
            Err(AtomError::Suspended(suspense)) => suspense,
            other => panic!("expected a suspension, got {other:?}"),
        };
        suspense.await;

        let result = project(&observer, &options, false).ok();
        assert_eq!(result.and_then(|r| r.data), Some(7));
    }

    #[tokio::test]
    async fn test_initial_data_never_suspends() {
        let client = QueryClient::new();
        let options = QueryOptions::new(query_key!["seeded"], |_| async { Ok(2_u8) })
            .with_suspense(true)
            .with_initial_data(1);
        let observer = QueryObserver::new(&client, options.clone());

        let result = project(&observer, &options, false).ok();
        assert_eq!(result.and_then(|r| r.data), Some(1));
    }

    #[tokio::test]
    async fn test_restoring_skips_suspension() {
        let client = QueryClient::new();
        let options = QueryOptions::new(query_key!["restoring"], |_| async { Ok(2_u8) }).with_suspense(true);
        let observer = QueryObserver::new(&client, options.clone());

        let result = project(&observer, &options, true).ok();
        assert!(result.is_some_and(|r| r.is_pending() && !r.is_fetching()));
    }

    #[tokio::test]
    async fn test_throw_policy_decides() {
        let client = QueryClient::new();
        let quiet = failing("fails");
        let observer = QueryObserver::new(&client, quiet.clone());
        observer.refetch(RefetchOptions::default()).await;

        let result = project(&observer, &quiet, false);
        assert!(result.is_ok_and(|r| r.is_error()));

        let loud = failing("fails").with_throw_on_error(ThrowOnError::when(|_, _| true));
        let error = project(&observer, &loud, false).err();
        assert_eq!(
            error.as_ref().and_then(AtomError::query_error),
            Some(&QueryError::FetchError("down".into()))
        );
    }
}
