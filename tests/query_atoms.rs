#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Scripted, settle, settle_until, store_with_client};
use query_atoms::{AtomError, QueryError};
use query_atoms::atoms::atom_with_query;
use query_atoms::bridge::{ClientAccessor, QueryAction, is_restoring_atom};
use query_atoms::query::{QueryClient, QueryConfig, QueryOptions, RefetchOptions};
use query_atoms::query_key;
use query_atoms::store::{Atom, Getter, Store};
use tokio::sync::Notify;
use tokio::time::Duration;

#[tokio::test]
async fn test_observer_is_reused_across_reads_and_mounts() {
    let (store, _client) = store_with_client();
    let script = Scripted::always(1_u32);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["stable"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );

    let sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;
    sub.unsubscribe();

    let _sub = store.sub(&cell, || {});
    for _ in 0..3 {
        assert_eq!(store.get(&cell).unwrap().data, Some(1));
    }
    settle().await;
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn test_refetch_resolves_with_new_data() {
    let (store, _client) = store_with_client();
    let script = Scripted::new([Ok(1_u32), Ok(2)]);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["refetch"], script.query_fn()))
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;

    let refetched = store.write(&cell, QueryAction::refetch()).await.unwrap();
    assert_eq!(refetched.map(|r| r.data), Some(Some(2)));
    assert_eq!(store.get(&cell).unwrap().data, Some(2));
    assert_eq!(script.calls(), 2);
}

#[tokio::test]
async fn test_force_refetch_starts_from_clean_state() {
    let (store, client) = store_with_client();
    let script = Scripted::new([Ok(1_u32), Ok(2)]);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["forced"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;

    let forced = store.write(&cell, QueryAction::force_refetch()).await.unwrap();
    assert!(forced.is_none());
    assert!(store.get(&cell).unwrap().data.is_none_or(|data| data == 2));

    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(2))).await;
    assert_eq!(script.calls(), 2);
    assert_eq!(client.get_query_data::<u32>(&query_key!["forced"]), Some(2));
}

#[tokio::test]
async fn test_disabled_query_waits_for_enabled() {
    let (store, _client) = store_with_client();
    let script = Scripted::always("ready");
    let enabled = Atom::new(false);
    let cell = atom_with_query(
        {
            let script = script.clone();
            let enabled = enabled.clone();
            move |get| {
                Ok(QueryOptions::new(query_key!["gated"], script.query_fn())
                    .with_enabled(get.get(&enabled)?))
            }
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle().await;
    assert_eq!(script.calls(), 0);
    assert!(store.get(&cell).is_ok_and(|r| r.is_pending() && !r.is_fetching()));

    store.set(&enabled, true);
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some("ready"))).await;
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn test_key_follows_atom_dependency() {
    let (store, _client) = store_with_client();
    let page = Atom::new(1_u32);
    let cell = atom_with_query(
        {
            let page = page.clone();
            move |get| {
                let page = get.get(&page)?;
                Ok(QueryOptions::new(query_key!["page", page], move |_| async move { Ok(page * 100) }))
            }
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(100))).await;

    store.set(&page, 2);
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(200))).await;
}

#[tokio::test]
async fn test_throwing_query_recovers_after_remount() {
    let (store, _client) = store_with_client();
    let script = Scripted::new([Ok(1_u32), Err(QueryError::FetchError("flaky".into())), Ok(3)]);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["flaky"], script.query_fn())
                    .with_retry(0)
                    .with_throw_on_error(true))
            }
        },
        None,
    );

    let mut seen = Vec::new();
    let sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data.is_some())).await;
    seen.extend(store.get(&cell).unwrap().data);

    let failed = store.write(&cell, QueryAction::refetch()).await;
    assert_eq!(failed.err(), Some(QueryError::FetchError("flaky".into())));
    assert_eq!(
        store.get(&cell).err().as_ref().and_then(|e| e.query_error()),
        Some(&QueryError::FetchError("flaky".into()))
    );

    sub.unsubscribe();
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data.is_some())).await;
    seen.extend(store.get(&cell).unwrap().data);

    assert_eq!(seen, vec![1, 3]);
    assert_eq!(script.calls(), 3);
}

#[tokio::test]
async fn test_cache_write_is_visible_without_fetching() {
    let (store, client) = store_with_client();
    let script = Scripted::always(0_u32);
    client.set_query_data(query_key!["written"], 42_u32);

    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["written"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    assert_eq!(store.get(&cell).unwrap().data, Some(42));

    client.set_query_data(query_key!["written"], 43_u32);
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(43))).await;
    assert_eq!(script.calls(), 0);
}

#[tokio::test]
async fn test_restoring_holds_fetch_status() {
    let (store, _client) = store_with_client();
    store.set(&is_restoring_atom(), true);
    let cell = atom_with_query(
        |_| Ok(QueryOptions::new(query_key!["restoring"], |_| async { Ok(1_u8) })),
        None,
    );

    let result = store.get(&cell).unwrap();
    assert!(result.is_pending());
    assert!(!result.is_fetching());
}

#[tokio::test]
async fn test_explicit_client_accessor() {
    let store = Store::new();
    let client = QueryClient::new();
    client.set_query_data(query_key!["explicit"], "cached");
    let accessor: ClientAccessor = {
        let client = client.clone();
        Arc::new(move |_: &Getter<'_>| Ok::<_, AtomError>(client.clone()))
    };

    let cell = atom_with_query(
        |_| {
            Ok(QueryOptions::new(query_key!["explicit"], |_| async { Ok("fetched") })
                .with_stale_time(Duration::from_secs(60)))
        },
        Some(accessor),
    );
    assert_eq!(store.get(&cell).unwrap().data, Some("cached"));
}

#[tokio::test]
async fn test_stores_share_client_cache() -> color_eyre::Result<()> {
    let client = QueryClient::new();
    let script = Scripted::always(9_u32);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["shared"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );

    let first = Store::new();
    let second = Store::new();
    query_atoms::bridge::provide_query_client(&first, client.clone());
    query_atoms::bridge::provide_query_client(&second, client.clone());

    let _sub = first.sub(&cell, || {});
    settle_until(|| first.get(&cell).is_ok_and(|r| r.data == Some(9))).await;
    let seen = second.get_async(&cell).await?;
    assert_eq!(seen.data, Some(9));
    assert_eq!(script.calls(), 1);
    Ok(())
}

/// Answers the first call right away and makes every later call wait for
/// `gate` before answering with its call number.
fn gated_after_first(calls: &Arc<AtomicUsize>, gate: &Arc<Notify>) -> QueryOptions<usize> {
    let (calls, gate) = (Arc::clone(calls), Arc::clone(gate));
    QueryOptions::new(query_key!["gated", "refetch"], move |_| {
        let (calls, gate) = (Arc::clone(&calls), Arc::clone(&gate));
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > 1 {
                gate.notified().await;
            }
            Ok(call)
        }
    })
}

#[tokio::test]
async fn test_refetch_can_join_running_fetch() {
    let (store, _client) = store_with_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let cell = atom_with_query(
        {
            let (calls, gate) = (Arc::clone(&calls), Arc::clone(&gate));
            move |_| Ok(gated_after_first(&calls, &gate))
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;

    let running = store.write(&cell, QueryAction::refetch());
    settle_until(|| calls.load(Ordering::SeqCst) == 2).await;

    let joined = store.write(
        &cell,
        QueryAction::refetch_with(RefetchOptions::default().with_cancel_refetch(false)),
    );
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    gate.notify_one();
    assert_eq!(joined.await.unwrap().and_then(|r| r.data), Some(2));
    assert_eq!(running.await.unwrap().and_then(|r| r.data), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_refetch_error_can_resolve_as_result() {
    let (store, _client) = store_with_client();
    let script = Scripted::new([Ok(1_u32), Err(QueryError::FetchError("down".into()))]);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["soft"], script.query_fn()).with_retry(0))
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;

    let quiet = RefetchOptions::default().with_throw_on_error(false);
    let result = store.write(&cell, QueryAction::refetch_with(quiet)).await.unwrap().unwrap();
    assert!(result.is_error());
    assert_eq!(result.data, Some(1));

    let loud = store.write(&cell, QueryAction::refetch()).await;
    assert_eq!(loud.err(), Some(QueryError::FetchError("down".into())));
}

#[tokio::test]
async fn test_force_refetch_ignores_replaced_observer() {
    let (store, client) = store_with_client();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let cell = atom_with_query(
        {
            let (calls, gate) = (Arc::clone(&calls), Arc::clone(&gate));
            move |_| {
                let (calls, gate) = (Arc::clone(&calls), Arc::clone(&gate));
                Ok(QueryOptions::new(query_key!["forced", "late"], move |_| {
                    let (calls, gate) = (Arc::clone(&calls), Arc::clone(&gate));
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) + 1 {
                            1 => Err(QueryError::FetchError("first".into())),
                            2 => {
                                gate.notified().await;
                                Ok(100_u32)
                            }
                            _ => Ok(2),
                        }
                    }
                })
                .with_retry(0)
                .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );
    let _sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.is_error())).await;
    let errored = store.get(&cell).unwrap();
    assert_eq!((errored.failure_count, errored.error_update_count), (1, 1));

    // a refetch through the old observer, held until after the force
    let late = store.write(&cell, QueryAction::refetch_with(RefetchOptions::default().with_throw_on_error(false)));
    settle_until(|| calls.load(Ordering::SeqCst) == 2).await;

    let forced = store.write(&cell, QueryAction::force_refetch()).await.unwrap();
    assert!(forced.is_none());
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(2))).await;

    gate.notify_one();
    let _ = late.await;
    settle().await;

    let result = store.get(&cell).unwrap();
    assert_eq!(result.data, Some(2));
    assert!(result.is_success());
    assert_eq!((result.failure_count, result.error_update_count), (0, 0));
    assert_eq!(client.get_query_data::<u32>(&query_key!["forced", "late"]), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_force_refetch_in_one_store_keeps_the_other_live() {
    let client = QueryClient::new();
    let script = Scripted::new([Ok(1_u32), Ok(2)]);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["two", "stores"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );
    let (first, second) = (Store::new(), Store::new());
    query_atoms::bridge::provide_query_client(&first, client.clone());
    query_atoms::bridge::provide_query_client(&second, client.clone());
    let _first_sub = first.sub(&cell, || {});
    let _second_sub = second.sub(&cell, || {});
    settle_until(|| first.get(&cell).is_ok_and(|r| r.data == Some(1))).await;
    settle_until(|| second.get(&cell).is_ok_and(|r| r.data == Some(1))).await;

    first.write(&cell, QueryAction::force_refetch()).await.unwrap();
    let settled = |store: &Store| store.get(&cell).is_ok_and(|r| r.data == Some(2) && !r.is_fetching());
    settle_until(|| settled(&first) && settled(&second)).await;

    client.set_query_data(query_key!["two", "stores"], 77_u32);
    settle_until(|| first.get(&cell).is_ok_and(|r| r.data == Some(77))).await;
    settle_until(|| second.get(&cell).is_ok_and(|r| r.data == Some(77))).await;
}

#[tokio::test]
async fn test_cache_write_while_unmounted_survives_remount() {
    let (store, client) = store_with_client();
    let script = Scripted::always(1_u32);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| {
                Ok(QueryOptions::new(query_key!["remount"], script.query_fn())
                    .with_stale_time(Duration::from_secs(60)))
            }
        },
        None,
    );
    let sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(1))).await;
    sub.unsubscribe();

    client.set_query_data(query_key!["remount"], 55_u32);
    assert_eq!(store.get(&cell).unwrap().data, Some(55));

    let _sub = store.sub(&cell, || {});
    assert_eq!(store.get(&cell).unwrap().data, Some(55));
    settle().await;
    assert_eq!(store.get(&cell).unwrap().data, Some(55));
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unused_query_is_collected_after_cache_time() {
    common::init_tracing();
    let client = QueryClient::with_config(QueryConfig::default().with_cache_time(Duration::from_secs(1)));
    let store = Store::new();
    query_atoms::bridge::provide_query_client(&store, client.clone());
    let script = Scripted::always(5_u32);
    let cell = atom_with_query(
        {
            let script = script.clone();
            move |_| Ok(QueryOptions::new(query_key!["collected"], script.query_fn()))
        },
        None,
    );

    let sub = store.sub(&cell, || {});
    settle_until(|| store.get(&cell).is_ok_and(|r| r.data == Some(5))).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    // observed queries stay
    assert_eq!(client.query_cache().len(), 1);

    sub.unsubscribe();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.query_cache().len(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(client.query_cache().is_empty());
    assert_eq!(client.get_query_data::<u32>(&query_key!["collected"]), None);
}
