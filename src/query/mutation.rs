//! Mutations: one-shot async writes tracked by a [`MutationObserver`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::emitter::{Emitter, ListenerId};
use crate::error::QueryError;

use super::client::QueryClient;
use super::config::RetryDelay;
use super::key::QueryKey;
use super::mutation_cache::{MutationId, MutationState, MutationStatus};

/// Boxed mutation function.
pub type MutationFn<T, V> =
    Arc<dyn Fn(V) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Options for a mutation.
pub struct MutationOptions<T, V> {
    mutation_fn: Option<MutationFn<T, V>>,
    pub mutation_key: Option<QueryKey>,
    pub retry: Option<u32>,
    pub retry_delay: Option<RetryDelay>,
    /// Raise a failed mutation as an error when its atom is read.
    pub throw_on_error: bool,
}

impl<T, V> MutationOptions<T, V>
where
    T: Send + 'static,
    V: Send + 'static,
{
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self {
            mutation_fn: Some(Arc::new(move |variables: V| mutation_fn(variables).boxed())),
            mutation_key: None,
            retry: None,
            retry_delay: None,
            throw_on_error: false,
        }
    }
}

impl<T, V> MutationOptions<T, V> {
    #[must_use]
    pub fn with_mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub const fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn mutation_fn(&self) -> Option<&MutationFn<T, V>> {
        self.mutation_fn.as_ref()
    }
}

impl<T, V> Clone for MutationOptions<T, V> {
    fn clone(&self) -> Self {
        Self {
            mutation_fn: self.mutation_fn.clone(),
            mutation_key: self.mutation_key.clone(),
            retry: self.retry,
            retry_delay: self.retry_delay,
            throw_on_error: self.throw_on_error,
        }
    }
}

impl<T, V> fmt::Debug for MutationOptions<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("retry", &self.retry)
            .field("throw_on_error", &self.throw_on_error)
            .finish_non_exhaustive()
    }
}

type SuccessFn<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;
type ErrorFn<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;
type SettledFn<T, V> = Arc<dyn Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync>;

/// Callbacks for a single `mutate` call.
///
/// They only run if the mutation is still the observer's current one when it
/// settles, i.e. it was neither reset nor superseded by a later call.
pub struct MutateOptions<T, V> {
    on_success: Option<SuccessFn<T, V>>,
    on_error: Option<ErrorFn<V>>,
    on_settled: Option<SettledFn<T, V>>,
}

impl<T, V> MutateOptions<T, V> {
    pub const fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&T, &V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&QueryError, &V) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    fn settle(&self, result: &Result<T, QueryError>, variables: &V) {
        match result {
            Ok(data) => {
                if let Some(on_success) = &self.on_success {
                    on_success(data, variables);
                }
                if let Some(on_settled) = &self.on_settled {
                    on_settled(Some(data), None, variables);
                }
            }
            Err(error) => {
                if let Some(on_error) = &self.on_error {
                    on_error(error, variables);
                }
                if let Some(on_settled) = &self.on_settled {
                    on_settled(None, Some(error), variables);
                }
            }
        }
    }
}

impl<T, V> Default for MutateOptions<T, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, V> Clone for MutateOptions<T, V> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, V> fmt::Debug for MutateOptions<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutateOptions")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// State of the latest mutation run through an observer.
#[derive(Debug, Clone)]
pub struct MutationObserverResult<T, V> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub variables: Option<V>,
    pub status: MutationStatus,
    pub failure_count: u32,
    pub submitted_at: Option<Instant>,
}

impl<T, V> MutationObserverResult<T, V> {
    pub const fn idle() -> Self {
        Self {
            data: None,
            error: None,
            variables: None,
            status: MutationStatus::Idle,
            failure_count: 0,
            submitted_at: None,
        }
    }

    pub const fn is_idle(&self) -> bool {
        matches!(self.status, MutationStatus::Idle)
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status, MutationStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, MutationStatus::Success)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, MutationStatus::Error)
    }
}

impl<T, V> Default for MutationObserverResult<T, V> {
    fn default() -> Self {
        Self::idle()
    }
}

struct MutationInner<T, V> {
    options: MutationOptions<T, V>,
    result: MutationObserverResult<T, V>,
    current: Option<MutationId>,
}

/// Runs mutations and reports the state of the latest one.
pub struct MutationObserver<T, V> {
    client: QueryClient,
    inner: Mutex<MutationInner<T, V>>,
    revision: AtomicU64,
    events: Emitter<MutationObserverResult<T, V>>,
}

impl<T, V> MutationObserver<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(client: &QueryClient, options: MutationOptions<T, V>) -> Arc<Self> {
        Arc::new(Self {
            client: client.clone(),
            inner: Mutex::new(MutationInner {
                options: client.default_mutation_options(options),
                result: MutationObserverResult::idle(),
                current: None,
            }),
            revision: AtomicU64::new(0),
            events: Emitter::new(),
        })
    }

    pub fn set_options(&self, options: MutationOptions<T, V>) {
        self.inner.lock().options = self.client.default_mutation_options(options);
    }

    pub fn options(&self) -> MutationOptions<T, V> {
        self.inner.lock().options.clone()
    }

    pub fn current_result(&self) -> MutationObserverResult<T, V> {
        self.inner.lock().result.clone()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult<T, V>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(listener)
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        self.events.off(listener);
    }

    pub fn has_listeners(&self) -> bool {
        !self.events.is_empty()
    }

    /// Increases on every change of the result.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Runs the mutation with `variables`.
    ///
    /// Inside a Tokio runtime the mutation is registered right away, then
    /// spawned, and runs to completion even if the returned future is
    /// dropped. Outside of one nothing happens until the future is polled.
    pub fn mutate(
        self: &Arc<Self>,
        variables: V,
        mutate_options: MutateOptions<T, V>,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        let this = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (id, options) = this.begin(&variables);
                let join = runtime.spawn(this.execute(id, options, variables, mutate_options));
                async move { join.await.unwrap_or(Err(QueryError::Cancelled)) }.boxed()
            }
            Err(_) => async move {
                let (id, options) = this.begin(&variables);
                this.execute(id, options, variables, mutate_options).await
            }
            .boxed(),
        }
    }

    /// Makes a new mutation the current one and registers it as pending.
    fn begin(&self, variables: &V) -> (MutationId, MutationOptions<T, V>) {
        let id = MutationId::next();
        let (options, previous) = {
            let mut inner = self.inner.lock();
            let previous = inner.current.replace(id);
            inner.result = MutationObserverResult {
                variables: Some(variables.clone()),
                status: MutationStatus::Pending,
                submitted_at: Some(Instant::now()),
                ..MutationObserverResult::idle()
            };
            (inner.options.clone(), previous)
        };
        if let Some(previous) = previous {
            self.forget(previous);
        }
        self.client.mutation_cache().add(MutationState::pending(
            id,
            options.mutation_key.clone(),
            variables.clone(),
        ));
        debug!(mutation = ?id, "mutation started");
        self.notify();
        (id, options)
    }

    async fn execute(
        self: Arc<Self>,
        id: MutationId,
        options: MutationOptions<T, V>,
        variables: V,
        mutate_options: MutateOptions<T, V>,
    ) -> Result<T, QueryError> {
        let result = match options.mutation_fn() {
            Some(mutation_fn) => {
                self.run(id, mutation_fn, &options, &variables).await
            }
            None => Err(QueryError::MissingQueryFn(
                options
                    .mutation_key
                    .as_ref()
                    .map_or_else(|| "mutation".to_string(), ToString::to_string),
            )),
        };

        self.client.mutation_cache().update(id, |state| match &result {
            Ok(data) => state.succeed(data.clone()),
            Err(error) => state.fail(error.clone()),
        });
        debug!(mutation = ?id, ok = result.is_ok(), "mutation finished");

        let is_current = {
            let mut inner = self.inner.lock();
            let is_current = inner.current == Some(id);
            if is_current {
                let failure_count = inner.result.failure_count;
                let submitted_at = inner.result.submitted_at;
                inner.result = match &result {
                    Ok(data) => MutationObserverResult {
                        data: Some(data.clone()),
                        variables: Some(variables.clone()),
                        status: MutationStatus::Success,
                        submitted_at,
                        ..MutationObserverResult::idle()
                    },
                    Err(error) => MutationObserverResult {
                        error: Some(error.clone()),
                        variables: Some(variables.clone()),
                        status: MutationStatus::Error,
                        failure_count: failure_count + 1,
                        submitted_at,
                        ..MutationObserverResult::idle()
                    },
                };
            }
            is_current
        };
        if is_current {
            self.notify();
            mutate_options.settle(&result, &variables);
        } else {
            trace!(mutation = ?id, "mutation settled after being superseded");
        }
        result
    }

    async fn run(
        &self,
        id: MutationId,
        mutation_fn: &MutationFn<T, V>,
        options: &MutationOptions<T, V>,
        variables: &V,
    ) -> Result<T, QueryError> {
        let retry = options.retry.unwrap_or(0);
        let retry_delay = options.retry_delay.unwrap_or_default();
        let mut failures = 0;
        loop {
            match mutation_fn(variables.clone()).await {
                Ok(data) => return Ok(data),
                Err(error) => {
                    failures += 1;
                    if failures > retry {
                        return Err(error);
                    }
                    trace!(mutation = ?id, failures, %error, "retrying mutation");
                    self.record_failure(id, failures);
                    tokio::time::sleep(retry_delay.for_failures(failures)).await;
                }
            }
        }
    }

    fn record_failure(&self, id: MutationId, failures: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.current != Some(id) {
                return;
            }
            inner.result.failure_count = failures;
        }
        self.client
            .mutation_cache()
            .update(id, |state| state.failure_count = failures);
        self.notify();
    }

    /// Forgets the latest mutation and returns to idle.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            inner.result = MutationObserverResult::idle();
            inner.current.take()
        };
        if let Some(previous) = previous {
            self.forget(previous);
        }
        self.notify();
    }

    /// Drops a settled mutation from the client's registry.
    fn forget(&self, id: MutationId) {
        let cache = self.client.mutation_cache();
        let settled = cache
            .find_all(&Default::default())
            .iter()
            .any(|state| state.mutation_id == id && !state.is_pending());
        if settled {
            cache.remove(id);
        }
    }

    fn notify(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        let result = self.current_result();
        self.events.emit(&result);
    }
}

impl<T, V> fmt::Debug for MutationObserver<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("client", &self.client.id())
            .field("listeners", &self.events.len())
            .finish_non_exhaustive()
    }
}
