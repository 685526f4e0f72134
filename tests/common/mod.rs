#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use query_atoms::QueryError;
use query_atoms::bridge::provide_query_client;
use query_atoms::query::{FetchContext, QueryClient};
use query_atoms::store::Store;
use tokio::time::{Duration, timeout};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A store with a fresh client provided to it.
pub fn store_with_client() -> (Store, QueryClient) {
    init_tracing();
    let store = Store::new();
    let client = QueryClient::new();
    provide_query_client(&store, client.clone());
    (store, client)
}

/// Yields to spawned tasks until `done` holds, failing after one second.
pub async fn settle_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !done() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Lets spawned tasks run for a while without waiting on anything.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// A query function that counts its calls and answers from a script.
///
/// Once the script runs out, the last answer is repeated.
#[derive(Clone)]
pub struct Scripted<T> {
    calls: Arc<AtomicUsize>,
    answers: Arc<Mutex<VecDeque<Result<T, QueryError>>>>,
    last: Arc<Mutex<Option<Result<T, QueryError>>>>,
}

impl<T> Scripted<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(answers: impl IntoIterator<Item = Result<T, QueryError>>) -> Self {
        Self {
            calls: Arc::default(),
            answers: Arc::new(Mutex::new(answers.into_iter().collect())),
            last: Arc::default(),
        }
    }

    pub fn always(value: T) -> Self {
        Self::new([Ok(value)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Result<T, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock();
        if let Some(next) = self.answers.lock().pop_front() {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(QueryError::FetchError("no answer scripted".into())))
    }

    /// The query function; answers immediately.
    pub fn query_fn(&self) -> impl Fn(FetchContext<T>) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static + use<T> {
        let script = self.clone();
        move |_| {
            let answer = script.answer();
            async move { answer }.boxed()
        }
    }
}
