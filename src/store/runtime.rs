use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{AtomError, QueryError};

use super::atom::{AnyAtom, Atom, AtomId, OnUnmount, Value, WritableAtom};
use super::suspense::Suspense;

type Listener = Arc<dyn Fn() + Send + Sync>;
type PendingWrite = Box<dyn FnOnce(&Store) + Send>;

struct AtomState {
    value: Result<Value, AtomError>,
    epoch: u64,
    deps: HashMap<AtomId, u64>,
}

#[derive(Default)]
struct Mounted {
    listeners: Vec<(u64, Listener)>,
    dependents: HashSet<AtomId>,
    on_unmount: Option<OnUnmount>,
}

impl Mounted {
    fn is_unused(&self) -> bool {
        self.listeners.is_empty() && self.dependents.is_empty()
    }
}

#[derive(Default)]
struct StoreState {
    atoms: HashMap<AtomId, AtomState>,
    defs: HashMap<AtomId, Arc<dyn AnyAtom>>,
    mounted: HashMap<AtomId, Mounted>,
    clock: u64,
    next_listener: u64,
    busy: usize,
    flushing: bool,
    pending: VecDeque<PendingWrite>,
    changed: HashSet<AtomId>,
}

impl StoreState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn epoch(&self, id: AtomId) -> Option<u64> {
        self.atoms.get(&id).map(|state| state.epoch)
    }
}

/// Process-unique identity of a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u64);

impl StoreId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct StoreInner {
    id: StoreId,
    state: Mutex<StoreState>,
}

/// Holds atom values and runs the dependency graph.
///
/// Operations are split in two phases. While the store is *busy* (evaluating
/// atoms, mounting, or propagating a write) any [`set`](Store::set) is queued.
/// When the outermost operation finishes, queued writes are applied in order
/// and listeners of every changed atom are notified once.
///
/// The internal lock is released before any user callback runs.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                id: StoreId::next(),
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    /// A handle that does not keep the store alive.
    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Reads an atom, evaluating it and its dependencies as needed.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T, AtomError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.enter();
        let value = self.read(atom);
        self.exit();
        value
    }

    /// Reads an atom, waiting for suspensions to settle.
    pub async fn get_async<T>(&self, atom: &Atom<T>) -> Result<T, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        loop {
            match self.get(atom) {
                Ok(value) => return Ok(value),
                Err(AtomError::Suspended(suspense)) => suspense.await,
                Err(AtomError::Query(error)) => return Err(error),
            }
        }
    }

    /// Sets a primitive atom.
    ///
    /// Mounted dependents are recomputed and their listeners notified. If the
    /// store is busy the write is deferred until it becomes idle.
    pub fn set<T>(&self, atom: &Atom<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.busy > 0 || state.flushing {
                trace!(atom = ?atom.id(), "deferring write until the store is idle");
                let atom = atom.clone();
                state
                    .pending
                    .push_back(Box::new(move |store: &Store| store.apply_set(&atom, value)));
                return;
            }
        }
        self.apply_set(atom, value);
    }

    /// Invokes the write function of a writable atom.
    pub fn write<T, A, R>(&self, atom: &WritableAtom<T, A, R>, arg: A) -> R {
        atom.call_write(&Setter { store: self }, arg)
    }

    /// Mounts an atom and calls `listener` whenever its value changes.
    ///
    /// The atom stays mounted until the returned [`Unsubscribe`] is dropped.
    pub fn sub<T, F>(&self, atom: &Atom<T>, listener: F) -> Unsubscribe
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let def = atom.erased();
        let id = def.id();
        self.enter();
        self.mount(&def, None);
        let listener_id = {
            let mut state = self.inner.state.lock();
            state.next_listener += 1;
            let listener_id = state.next_listener;
            if let Some(mounted) = state.mounted.get_mut(&id) {
                mounted.listeners.push((listener_id, Arc::new(listener)));
            }
            listener_id
        };
        self.exit();
        Unsubscribe {
            store: self.clone(),
            atom: id,
            listener: listener_id,
        }
    }

    /// Returns `true` if the atom currently has subscribers or mounted dependents.
    pub fn is_mounted<T>(&self, atom: &Atom<T>) -> bool {
        self.inner.state.lock().mounted.contains_key(&atom.id())
    }

    /// Number of atoms holding a value in this store.
    pub fn len(&self) -> usize {
        self.inner.state.lock().atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the values of unmounted atoms that no handle refers to anymore.
    ///
    /// Runs to a fixpoint, since a dropped value may hold the last handle of
    /// another atom. Does nothing while the store is busy. Returns how many
    /// atoms were dropped.
    pub fn prune(&self) -> usize {
        let mut pruned = 0;
        loop {
            let dropped: Vec<(Arc<dyn AnyAtom>, Option<AtomState>)> = {
                let mut state = self.inner.state.lock();
                if state.busy > 0 || state.flushing {
                    return pruned;
                }
                let orphans: Vec<AtomId> = state
                    .defs
                    .iter()
                    .filter(|(id, def)| !state.mounted.contains_key(*id) && def.is_orphaned())
                    .map(|(id, _)| *id)
                    .collect();
                orphans
                    .into_iter()
                    .filter_map(|id| {
                        let def = state.defs.remove(&id)?;
                        Some((def, state.atoms.remove(&id)))
                    })
                    .collect()
            };
            if dropped.is_empty() {
                break;
            }
            pruned += dropped.len();
            // values are dropped here, outside the lock
            drop(dropped);
        }
        if pruned > 0 {
            trace!(pruned, "pruned unreferenced atoms");
        }
        pruned
    }

    fn enter(&self) {
        self.inner.state.lock().busy += 1;
    }

    fn exit(&self) {
        let flush = {
            let mut state = self.inner.state.lock();
            state.busy -= 1;
            let idle = state.busy == 0 && !state.flushing;
            let dirty = !state.pending.is_empty() || !state.changed.is_empty();
            if idle && dirty {
                state.flushing = true;
            }
            idle && dirty
        };
        if flush {
            self.flush();
        }
    }

    /// Applies deferred writes, then notifies listeners of changed atoms.
    fn flush(&self) {
        loop {
            let next = self.inner.state.lock().pending.pop_front();
            if let Some(write) = next {
                write(self);
                continue;
            }

            let listeners: Vec<Listener> = {
                let mut state = self.inner.state.lock();
                let changed = std::mem::take(&mut state.changed);
                let listeners: Vec<Listener> = changed
                    .iter()
                    .filter_map(|id| state.mounted.get(id))
                    .flat_map(|mounted| mounted.listeners.iter().map(|(_, l)| Arc::clone(l)))
                    .collect();
                if listeners.is_empty() && state.pending.is_empty() {
                    state.flushing = false;
                    return;
                }
                listeners
            };
            for listener in listeners {
                listener();
            }
        }
    }

    fn apply_set<T>(&self, atom: &Atom<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let def = atom.erased();
        let id = def.id();
        self.enter();
        {
            let mut state = self.inner.state.lock();
            state.defs.entry(id).or_insert_with(|| Arc::clone(&def));
            let epoch = state.tick();
            state.atoms.insert(
                id,
                AtomState {
                    value: Ok(Arc::new(value)),
                    epoch,
                    deps: HashMap::new(),
                },
            );
            state.changed.insert(id);
        }
        self.propagate(id);
        self.exit();
    }

    fn read<T>(&self, atom: &Atom<T>) -> Result<T, AtomError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let def = atom.erased();
        self.ensure_fresh(&def);
        let value = self
            .inner
            .state
            .lock()
            .atoms
            .get(&def.id())
            .map(|state| state.value.clone());
        match value {
            Some(Ok(value)) => Ok(downcast(&value, atom)),
            Some(Err(error)) => Err(error),
            None => Err(AtomError::Suspended(Suspense::ready())),
        }
    }

    /// Brings an atom up to date and returns its epoch.
    ///
    /// A derived atom is recomputed when it has no value yet, when one of its
    /// recorded dependencies has a newer epoch, or when its value is a
    /// suspension that has settled.
    fn ensure_fresh(&self, def: &Arc<dyn AnyAtom>) -> u64 {
        let id = def.id();
        if let Some(version) = def.version() {
            return self.sync_version(def, version);
        }
        let deps = {
            let mut state = self.inner.state.lock();
            state.defs.entry(id).or_insert_with(|| Arc::clone(def));
            match state.atoms.get(&id) {
                Some(atom) if def.is_primitive() => return atom.epoch,
                Some(atom) => match &atom.value {
                    Err(AtomError::Suspended(suspense)) if suspense.is_settled() => None,
                    _ => Some(atom.deps.clone()),
                },
                None => None,
            }
        };

        if def.is_primitive() {
            return self.init_primitive(def);
        }

        if let Some(deps) = deps {
            let mut stale = false;
            for (dep_id, seen) in &deps {
                let dep = self.inner.state.lock().defs.get(dep_id).cloned();
                let Some(dep) = dep else {
                    stale = true;
                    break;
                };
                if self.ensure_fresh(&dep) != *seen {
                    stale = true;
                    break;
                }
            }
            if !stale {
                if let Some(epoch) = self.inner.state.lock().epoch(id) {
                    return epoch;
                }
            }
        }

        self.recompute(def)
    }

    /// Stores the version of a versioned atom, with a new epoch if it moved.
    fn sync_version(&self, def: &Arc<dyn AnyAtom>, version: u64) -> u64 {
        let id = def.id();
        let mut state = self.inner.state.lock();
        state.defs.entry(id).or_insert_with(|| Arc::clone(def));
        if let Some(atom) = state.atoms.get(&id) {
            let current = atom
                .value
                .as_ref()
                .is_ok_and(|value| value.downcast_ref::<u64>() == Some(&version));
            if current {
                return atom.epoch;
            }
        }
        let epoch = state.tick();
        state.atoms.insert(
            id,
            AtomState {
                value: Ok(Arc::new(version)),
                epoch,
                deps: HashMap::new(),
            },
        );
        if state.mounted.contains_key(&id) {
            state.changed.insert(id);
        }
        epoch
    }

    fn init_primitive(&self, def: &Arc<dyn AnyAtom>) -> u64 {
        let initial = def.initial();
        let mut state = self.inner.state.lock();
        if let Some(epoch) = state.epoch(def.id()) {
            return epoch;
        }
        let epoch = state.tick();
        let value = initial.ok_or_else(|| AtomError::Suspended(Suspense::ready()));
        state.atoms.insert(
            def.id(),
            AtomState {
                value,
                epoch,
                deps: HashMap::new(),
            },
        );
        epoch
    }

    fn recompute(&self, def: &Arc<dyn AnyAtom>) -> u64 {
        let id = def.id();
        let getter = Getter {
            store: self,
            deps: RefCell::new(HashMap::new()),
        };
        let value = def.compute(&getter);
        let deps = getter.deps.into_inner();

        let suspense = match &value {
            Err(AtomError::Suspended(suspense)) => Some(suspense.clone()),
            _ => None,
        };
        let (epoch, mounted, old_deps) = {
            let mut state = self.inner.state.lock();
            let epoch = state.tick();
            let old_deps = state
                .atoms
                .insert(
                    id,
                    AtomState {
                        value,
                        epoch,
                        deps: deps.clone(),
                    },
                )
                .map(|old| old.deps)
                .unwrap_or_default();
            let mounted = state.mounted.contains_key(&id);
            if mounted {
                state.changed.insert(id);
            }
            (epoch, mounted, old_deps)
        };

        if mounted {
            for dep in deps.keys().filter(|dep| !old_deps.contains_key(*dep)) {
                self.mount_by_id(*dep, id);
            }
            for dep in old_deps.keys().filter(|dep| !deps.contains_key(*dep)) {
                self.remove_dependent(*dep, id);
            }
            if let Some(suspense) = suspense {
                self.watch(id, suspense);
            }
        }
        epoch
    }

    /// Recomputes mounted dependents of `id` in topological order.
    fn propagate(&self, id: AtomId) {
        for dependent in self.dependents_in_order(id) {
            let def = self.inner.state.lock().defs.get(&dependent).cloned();
            if let Some(def) = def {
                self.ensure_fresh(&def);
            }
        }
    }

    fn dependents_in_order(&self, id: AtomId) -> Vec<AtomId> {
        fn visit(
            id: AtomId,
            mounted: &HashMap<AtomId, Mounted>,
            seen: &mut HashSet<AtomId>,
            order: &mut Vec<AtomId>,
        ) {
            if !seen.insert(id) {
                return;
            }
            if let Some(entry) = mounted.get(&id) {
                for dependent in &entry.dependents {
                    visit(*dependent, mounted, seen, order);
                }
            }
            order.push(id);
        }

        let state = self.inner.state.lock();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        visit(id, &state.mounted, &mut seen, &mut order);
        order.pop();
        order.reverse();
        order
    }

    fn mount_by_id(&self, id: AtomId, dependent: AtomId) {
        let def = self.inner.state.lock().defs.get(&id).cloned();
        if let Some(def) = def {
            self.mount(&def, Some(dependent));
        }
    }

    fn mount(&self, def: &Arc<dyn AnyAtom>, dependent: Option<AtomId>) {
        let id = def.id();
        let newly_mounted = {
            let mut state = self.inner.state.lock();
            let newly_mounted = !state.mounted.contains_key(&id);
            let entry = state.mounted.entry(id).or_default();
            if let Some(dependent) = dependent {
                entry.dependents.insert(dependent);
            }
            newly_mounted
        };
        if !newly_mounted {
            return;
        }

        trace!(atom = ?id, label = def.label(), "mounting atom");
        self.ensure_fresh(def);
        let (deps, suspense) = {
            let mut state = self.inner.state.lock();
            // nothing listened to the value computed for mounting
            state.changed.remove(&id);
            match state.atoms.get(&id) {
                Some(atom) => (
                    atom.deps.keys().copied().collect::<Vec<_>>(),
                    atom.value.as_ref().err().and_then(AtomError::suspense).cloned(),
                ),
                None => (Vec::new(), None),
            }
        };
        for dep in deps {
            self.mount_by_id(dep, id);
        }
        if let Some(suspense) = suspense {
            self.watch(id, suspense);
        }
        if let Some(on_unmount) = def.mount(self) {
            // unmounted again while the hook ran
            let orphaned = match self.inner.state.lock().mounted.get_mut(&id) {
                Some(entry) => {
                    entry.on_unmount = Some(on_unmount);
                    None
                }
                None => Some(on_unmount),
            };
            if let Some(on_unmount) = orphaned {
                on_unmount();
            }
        }
    }

    fn remove_dependent(&self, id: AtomId, dependent: AtomId) {
        if let Some(entry) = self.inner.state.lock().mounted.get_mut(&id) {
            entry.dependents.remove(&dependent);
        }
        self.unmount_if_unused(id);
    }

    fn unmount_if_unused(&self, id: AtomId) {
        let (on_unmount, deps) = {
            let mut state = self.inner.state.lock();
            if !state.mounted.get(&id).is_some_and(Mounted::is_unused) {
                return;
            }
            let on_unmount = state.mounted.remove(&id).and_then(|entry| entry.on_unmount);
            let deps: Vec<AtomId> = state
                .atoms
                .get(&id)
                .map(|atom| atom.deps.keys().copied().collect())
                .unwrap_or_default();
            (on_unmount, deps)
        };

        trace!(atom = ?id, "unmounting atom");
        if let Some(on_unmount) = on_unmount {
            on_unmount();
        }
        for dep in deps {
            self.remove_dependent(dep, id);
        }
    }

    fn unsubscribe(&self, id: AtomId, listener: u64) {
        self.enter();
        if let Some(entry) = self.inner.state.lock().mounted.get_mut(&id) {
            entry.listeners.retain(|(lid, _)| *lid != listener);
        }
        self.unmount_if_unused(id);
        self.exit();
        self.prune();
    }

    /// Re-evaluates a mounted atom once its suspension settles.
    fn watch(&self, id: AtomId, suspense: Suspense) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!(atom = ?id, "no runtime, suspended atom refreshes on next read");
            return;
        };
        let store = self.clone();
        runtime.spawn(async move {
            suspense.await;
            store.refresh(id);
        });
    }

    fn refresh(&self, id: AtomId) {
        self.enter();
        let def = {
            let state = self.inner.state.lock();
            if state.mounted.contains_key(&id) {
                state.defs.get(&id).cloned()
            } else {
                None
            }
        };
        if let Some(def) = def {
            let before = self.inner.state.lock().epoch(id);
            if Some(self.ensure_fresh(&def)) != before {
                self.propagate(id);
            }
        }
        self.exit();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("atoms", &state.atoms.len())
            .field("mounted", &state.mounted.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// A [`Store`] handle that does not keep it alive.
#[derive(Clone)]
pub struct WeakStore {
    id: StoreId,
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub const fn id(&self) -> StoreId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStore")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn downcast<T>(value: &Value, atom: &Atom<T>) -> T
where
    T: Clone + Send + Sync + 'static,
{
    match value.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => unreachable!("atom {:?} holds a value of another type", atom.id()),
    }
}

/// Read access handed to derived atoms; records dependencies.
pub struct Getter<'a> {
    store: &'a Store,
    deps: RefCell<HashMap<AtomId, u64>>,
}

impl Getter<'_> {
    /// Reads `atom` and records it as a dependency of the atom being evaluated.
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T, AtomError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let def = atom.erased();
        let epoch = self.store.ensure_fresh(&def);
        self.deps.borrow_mut().insert(def.id(), epoch);
        let value = self
            .store
            .inner
            .state
            .lock()
            .atoms
            .get(&def.id())
            .map(|state| state.value.clone());
        match value {
            Some(Ok(value)) => Ok(downcast(&value, atom)),
            Some(Err(error)) => Err(error),
            None => Err(AtomError::Suspended(Suspense::ready())),
        }
    }

    pub const fn store(&self) -> &Store {
        self.store
    }
}

/// Read/write access handed to write functions.
pub struct Setter<'a> {
    store: &'a Store,
}

impl Setter<'_> {
    pub fn get<T>(&self, atom: &Atom<T>) -> Result<T, AtomError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.store.get(atom)
    }

    pub fn set<T>(&self, atom: &Atom<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.store.set(atom, value);
    }

    pub fn write<T, A, R>(&self, atom: &WritableAtom<T, A, R>, arg: A) -> R {
        self.store.write(atom, arg)
    }

    pub const fn store(&self) -> &Store {
        self.store
    }
}

/// Keeps an atom subscription alive; unsubscribes when dropped.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct Unsubscribe {
    store: Store,
    atom: AtomId,
    listener: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.store.unsubscribe(self.atom, self.listener);
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("atom", &self.atom)
            .field("listener", &self.listener)
            .finish()
    }
}
