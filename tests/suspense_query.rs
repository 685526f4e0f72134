#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Scripted, settle, store_with_client};
use query_atoms::{AtomError, QueryError};
use query_atoms::atoms::atom_with_suspense_query;
use query_atoms::bridge::{QueryAction, QueryErrorResetBoundary, SUSPENSE_STALE_TIME};
use query_atoms::query::QueryOptions;
use query_atoms::query_key;
use query_atoms::store::Getter;
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

#[tokio::test]
async fn test_two_suspending_cells_share_one_fetch() -> color_eyre::Result<()> {
    let (store, _client) = store_with_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let options = {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        move |_: &Getter<'_>| {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            Ok::<_, AtomError>(QueryOptions::new(query_key!["shared", "suspense"], move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(5_u32)
                }
            }))
        }
    };
    let first = atom_with_suspense_query(options.clone(), None);
    let second = atom_with_suspense_query(options, None);

    let _first_sub = store.sub(&first, || {});
    let _second_sub = store.sub(&second, || {});
    assert!(store.get(&first).is_err_and(|e| e.suspense().is_some()));
    assert!(store.get(&second).is_err_and(|e| e.suspense().is_some()));

    gate.notify_one();
    let (a, b) = futures::join!(store.get_async(&first), store.get_async(&second));
    assert_eq!(a?.data, Some(5));
    assert_eq!(b?.data, Some(5));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_initial_data_never_suspends() {
    let (store, _client) = store_with_client();
    let script = Scripted::always(2_u32);
    let cell = atom_with_suspense_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["seeded"], script.query_fn())
                    .with_initial_data(1)
                    .with_stale_time(Duration::ZERO))
            }
        },
        None,
    );

    assert_eq!(store.get(&cell).unwrap().data, Some(1));
}

#[tokio::test]
async fn test_suspense_uses_default_stale_time() {
    let (store, _client) = store_with_client();
    let script = Scripted::always(1_u8);
    let cell = atom_with_suspense_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["fresh"], script.query_fn()))
        },
        None,
    );

    assert_eq!(store.get_async(&cell).await.unwrap().data, Some(1));
    let _sub = store.sub(&cell, || {});
    let mounted = store.get(&cell).unwrap();
    assert!(!mounted.is_stale);
    assert!(!mounted.is_fetching());
    settle().await;
    assert_eq!(script.calls(), 1);
    assert_eq!(mounted.data_updated_at.map(|at| at.elapsed() < SUSPENSE_STALE_TIME), Some(true));
}

#[tokio::test]
async fn test_failed_refetch_keeps_data() {
    let (store, _client) = store_with_client();
    let script = Scripted::new([Ok(1_u32), Err(QueryError::FetchError("late".into()))]);
    let cell = atom_with_suspense_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["kept"], script.query_fn()).with_retry(0))
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    assert_eq!(store.get_async(&cell).await.unwrap().data, Some(1));

    let refetched = store.write(&cell, QueryAction::refetch()).await;
    assert_eq!(refetched.err(), Some(QueryError::FetchError("late".into())));

    let result = store.get(&cell).unwrap();
    assert!(result.is_error());
    assert_eq!(result.data, Some(1));
}

#[tokio::test]
async fn test_reset_boundary_retries_errored_query() {
    let (store, _client) = store_with_client();
    let script = Scripted::new([Err(QueryError::NetworkError("offline".into())), Ok(7_u32)]);
    let cell = atom_with_suspense_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["boundary"], script.query_fn()).with_retry(0))
        },
        None,
    );

    let error = store.get_async(&cell).await.err();
    assert_eq!(error, Some(QueryError::NetworkError("offline".into())));

    // without a reset the error stays put
    assert!(store.get(&cell).is_err_and(|e| e.query_error().is_some()));
    assert_eq!(script.calls(), 1);

    let boundary = QueryErrorResetBoundary::new(store.clone());
    boundary.reset();
    assert!(boundary.is_reset());

    let recovered = timeout(Duration::from_secs(1), store.get_async(&cell))
        .await
        .expect("reset query did not settle");
    assert_eq!(recovered.unwrap().data, Some(7));

    let _sub = store.sub(&cell, || {});
    assert!(!boundary.is_reset());
}
