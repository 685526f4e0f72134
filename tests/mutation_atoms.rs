#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{settle_until, store_with_client};
use query_atoms::QueryError;
use query_atoms::atoms::{
    MutationStateOptions, atom_with_mutation, atom_with_mutation_state, atom_with_query,
};
use query_atoms::query::{MutateOptions, MutationFilters, MutationOptions, QueryOptions};
use query_atoms::query_key;
use tokio::sync::Semaphore;
use tokio::time::Duration;

#[tokio::test]
async fn test_mutation_updates_query_cell() {
    let (store, client) = store_with_client();
    let todos = atom_with_query(
        |_| {
            Ok(QueryOptions::new(query_key!["todos"], |_| async { Ok(vec!["write docs".to_string()]) })
                .with_stale_time(Duration::from_secs(60)))
        },
        None,
    );
    let add = atom_with_mutation(
        |_| Ok(MutationOptions::new(|title: String| async move { Ok::<_, QueryError>(title) })),
        None,
    );
    let _todos_sub = store.sub(&todos, || {});
    let _add_sub = store.sub(&add, || {});
    settle_until(|| store.get(&todos).is_ok_and(|r| r.data.is_some())).await;

    let on_success = {
        let client = client.clone();
        move |title: &String, _: &String| {
            let mut todos: Vec<String> = client.get_query_data(&query_key!["todos"]).unwrap_or_default();
            todos.push(title.clone());
            client.set_query_data(query_key!["todos"], todos);
        }
    };
    let added = store
        .get(&add)
        .unwrap()
        .mutate_async("ship it".to_string(), MutateOptions::new().on_success(on_success))
        .await;
    assert_eq!(added.as_deref(), Ok("ship it"));

    settle_until(|| store.get(&todos).is_ok_and(|r| r.data.as_ref().is_some_and(|t| t.len() == 2))).await;
    settle_until(|| store.get(&add).is_ok_and(|r| r.is_success())).await;
    assert_eq!(store.get(&add).unwrap().variables.as_deref(), Some("ship it"));
}

#[tokio::test]
async fn test_unmount_resets_mutation() {
    let (store, _client) = store_with_client();
    let double = atom_with_mutation(
        |_| Ok(MutationOptions::new(|n: i32| async move { Ok::<_, QueryError>(n * 2) })),
        None,
    );

    let sub = store.sub(&double, || {});
    store.get(&double).unwrap().mutate(4);
    settle_until(|| store.get(&double).is_ok_and(|r| r.data == Some(8))).await;

    sub.unsubscribe();
    let _sub = store.sub(&double, || {});
    assert!(store.get(&double).unwrap().is_idle());
}

#[tokio::test]
async fn test_manual_reset() {
    let (store, _client) = store_with_client();
    let cell = atom_with_mutation(
        |_| Ok(MutationOptions::new(|_: ()| async { Err::<(), _>(QueryError::FetchError("no".into())) })),
        None,
    );
    let _sub = store.sub(&cell, || {});

    store.get(&cell).unwrap().mutate(());
    settle_until(|| store.get(&cell).is_ok_and(|r| r.is_error())).await;

    store.get(&cell).unwrap().reset();
    settle_until(|| store.get(&cell).is_ok_and(|r| r.is_idle())).await;
}

#[tokio::test]
async fn test_mutation_state_filters_by_key() {
    let (store, _client) = store_with_client();
    let gate = Arc::new(Semaphore::new(0));
    let options = |key: &'static str, gate: &Arc<Semaphore>| {
        let gate = Arc::clone(gate);
        move |_: &query_atoms::store::Getter<'_>| {
            let gate = Arc::clone(&gate);
            Ok::<_, query_atoms::AtomError>(
                MutationOptions::new(move |n: u32| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _permit = gate.acquire().await;
                        Ok::<_, QueryError>(n)
                    }
                })
                .with_mutation_key(query_key![key]),
            )
        }
    };
    let uploads = atom_with_mutation(options("upload", &gate), None);
    let deletes = atom_with_mutation(options("delete", &gate), None);
    let pending_uploads = atom_with_mutation_state(
        |_| {
            Ok(MutationStateOptions::select(|state| state.variables::<u32>().copied())
                .with_filters(MutationFilters::key(query_key!["upload"])))
        },
        None,
    );

    let _uploads_sub = store.sub(&uploads, || {});
    let _deletes_sub = store.sub(&deletes, || {});
    let _pending_sub = store.sub(&pending_uploads, || {});

    let upload = store.get(&uploads).unwrap().mutate_async(1, MutateOptions::new());
    let delete = store.get(&deletes).unwrap().mutate_async(2, MutateOptions::new());
    assert_eq!(store.get(&pending_uploads).ok(), Some(vec![Some(1)]));

    gate.add_permits(2);
    assert_eq!(upload.await, Ok(1));
    assert_eq!(delete.await, Ok(2));
    settle_until(|| store.get(&pending_uploads).is_ok_and(|p| p.is_empty())).await;
}
