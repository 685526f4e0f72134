use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::emitter::{Emitter, ListenerId};
use crate::error::QueryError;

use super::key::QueryKey;

/// Identity of one `mutate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

impl MutationId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

type Erased = Arc<dyn Any + Send + Sync>;

/// Type-erased state of one mutation, as kept by the [`MutationCache`].
#[derive(Clone)]
pub struct MutationState {
    pub mutation_id: MutationId,
    pub mutation_key: Option<QueryKey>,
    pub status: MutationStatus,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub submitted_at: Option<Instant>,
    variables: Option<Erased>,
    data: Option<Erased>,
}

impl MutationState {
    pub(crate) fn pending<V>(id: MutationId, key: Option<QueryKey>, variables: V) -> Self
    where
        V: Send + Sync + 'static,
    {
        Self {
            mutation_id: id,
            mutation_key: key,
            status: MutationStatus::Pending,
            error: None,
            failure_count: 0,
            submitted_at: Some(Instant::now()),
            variables: Some(Arc::new(variables)),
            data: None,
        }
    }

    pub(crate) fn succeed<T>(&mut self, data: T)
    where
        T: Send + Sync + 'static,
    {
        self.status = MutationStatus::Success;
        self.data = Some(Arc::new(data));
        self.error = None;
        self.failure_count = 0;
    }

    pub(crate) fn fail(&mut self, error: QueryError) {
        self.status = MutationStatus::Error;
        self.error = Some(error);
        self.failure_count += 1;
    }

    /// Variables the mutation was called with, if they are a `V`.
    pub fn variables<V: 'static>(&self) -> Option<&V> {
        self.variables.as_ref()?.downcast_ref::<V>()
    }

    /// Data the mutation resolved with, if it is a `T`.
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref::<T>()
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.status, MutationStatus::Pending)
    }
}

impl fmt::Debug for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationState")
            .field("mutation_id", &self.mutation_id)
            .field("mutation_key", &self.mutation_key)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}

/// Selects mutations in the [`MutationCache`].
#[derive(Debug, Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<QueryKey>,
    pub exact: bool,
    pub status: Option<MutationStatus>,
}

impl MutationFilters {
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, state: &MutationState) -> bool {
        let status = self.status.is_none_or(|status| status == state.status);
        let key = match (&self.mutation_key, &state.mutation_key) {
            (None, _) => true,
            (Some(filter), Some(key)) => key.matches(filter, self.exact),
            (Some(_), None) => false,
        };
        status && key
    }
}

/// Change notifications of the [`MutationCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationCacheEvent {
    Added(MutationId),
    Updated(MutationId),
    Removed(MutationId),
}

/// Registry of the mutations run through one client, in submission order.
#[derive(Default)]
pub struct MutationCache {
    mutations: Mutex<Vec<MutationState>>,
    events: Emitter<MutationCacheEvent>,
}

impl MutationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, state: MutationState) {
        let id = state.mutation_id;
        self.mutations.lock().push(state);
        self.events.emit(&MutationCacheEvent::Added(id));
    }

    pub(crate) fn update(&self, id: MutationId, update: impl FnOnce(&mut MutationState)) {
        let found = {
            let mut mutations = self.mutations.lock();
            match mutations.iter_mut().find(|m| m.mutation_id == id) {
                Some(state) => {
                    update(state);
                    true
                }
                None => false,
            }
        };
        if found {
            self.events.emit(&MutationCacheEvent::Updated(id));
        }
    }

    pub fn remove(&self, id: MutationId) {
        let removed = {
            let mut mutations = self.mutations.lock();
            let before = mutations.len();
            mutations.retain(|m| m.mutation_id != id);
            mutations.len() != before
        };
        if removed {
            self.events.emit(&MutationCacheEvent::Removed(id));
        }
    }

    pub fn find_all(&self, filters: &MutationFilters) -> Vec<MutationState> {
        self.mutations
            .lock()
            .iter()
            .filter(|state| filters.matches(state))
            .cloned()
            .collect()
    }

    /// Number of mutations matching `filters` that are still pending.
    pub fn count_pending(&self, filters: &MutationFilters) -> usize {
        self.mutations
            .lock()
            .iter()
            .filter(|state| state.is_pending() && filters.matches(state))
            .count()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.on(listener)
    }

    pub fn unsubscribe(&self, listener: ListenerId) {
        self.events.off(listener);
    }

    pub fn clear(&self) {
        let removed: Vec<MutationId> = self
            .mutations
            .lock()
            .drain(..)
            .map(|m| m.mutation_id)
            .collect();
        for id in removed {
            self.events.emit(&MutationCacheEvent::Removed(id));
        }
    }

    pub fn len(&self) -> usize {
        self.mutations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.lock().is_empty()
    }
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.len())
            .finish()
    }
}
