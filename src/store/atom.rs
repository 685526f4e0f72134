use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AtomError;

use super::runtime::{Getter, Setter, Store};

/// Process-unique identity of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Type-erased atom value as held by a [`Store`].
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Cleanup returned by a mount hook, run when the atom is unmounted.
pub type OnUnmount = Box<dyn FnOnce() + Send>;

type ReadFn<T> = dyn Fn(&Getter<'_>) -> Result<T, AtomError> + Send + Sync;
type MountFn<T> = dyn Fn(AtomSetter<T>) -> Option<OnUnmount> + Send + Sync;
type WriteFn<A, R> = dyn Fn(&Setter<'_>, A) -> R + Send + Sync;
type VersionFn = dyn Fn() -> u64 + Send + Sync;

enum AtomKind<T> {
    Primitive {
        initial: T,
        on_mount: Option<Arc<MountFn<T>>>,
    },
    Derived {
        read: Arc<ReadFn<T>>,
    },
    Versioned {
        version: Arc<VersionFn>,
    },
}

struct AtomInner<T> {
    id: AtomId,
    kind: AtomKind<T>,
    label: Option<String>,
}

/// A reactive cell.
///
/// Atoms are only definitions: their values live in a [`Store`]. A handle is
/// cheap to clone and every clone refers to the same cell.
///
/// # Example
///
/// ```rust
/// use query_atoms::store::{Atom, Store};
///
/// let count = Atom::new(1);
/// let doubled = {
///     let count = count.clone();
///     Atom::derived(move |get| Ok(get.get(&count)? * 2))
/// };
///
/// let store = Store::new();
/// store.set(&count, 21);
/// assert_eq!(store.get(&doubled).ok(), Some(42));
/// ```
pub struct Atom<T> {
    inner: Arc<AtomInner<T>>,
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a primitive atom holding `initial` until it is set.
    pub fn new(initial: T) -> Self {
        Self::from_kind(AtomKind::Primitive {
            initial,
            on_mount: None,
        })
    }

    /// Creates a primitive atom with a mount hook.
    ///
    /// The hook runs when the atom gains its first subscriber (directly or
    /// through a dependent) and may return a cleanup that runs on the last
    /// unmount. Values set through the given [`AtomSetter`] while the store is
    /// busy are applied once it becomes idle.
    pub fn with_on_mount<F>(initial: T, on_mount: F) -> Self
    where
        F: Fn(AtomSetter<T>) -> Option<OnUnmount> + Send + Sync + 'static,
    {
        Self::from_kind(AtomKind::Primitive {
            initial,
            on_mount: Some(Arc::new(on_mount)),
        })
    }

    /// Creates a derived atom computed from other atoms.
    ///
    /// Every atom read through the [`Getter`] becomes a dependency; the value is
    /// recomputed when any of them changes.
    pub fn derived<F>(read: F) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T, AtomError> + Send + Sync + 'static,
    {
        Self::from_kind(AtomKind::Derived {
            read: Arc::new(read),
        })
    }

    fn from_kind(kind: AtomKind<T>) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                id: AtomId::next(),
                kind,
                label: None,
            }),
        }
    }

    /// Attaches a debug label shown in logs.
    #[must_use]
    pub fn with_label(self, label: impl Into<String>) -> Self {
        let label = Some(label.into());
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Self {
                inner: Arc::new(AtomInner { label, ..inner }),
            },
            Err(inner) => Self { inner },
        }
    }

    /// Wraps this atom with a write function.
    pub fn writable<A, R, W>(self, write: W) -> WritableAtom<T, A, R>
    where
        W: Fn(&Setter<'_>, A) -> R + Send + Sync + 'static,
    {
        WritableAtom {
            atom: self,
            write: Arc::new(write),
        }
    }

    pub(crate) fn erased(&self) -> Arc<dyn AnyAtom> {
        Arc::new(self.clone())
    }
}

impl<T> Atom<T> {
    pub fn id(&self) -> AtomId {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.inner.kind, AtomKind::Primitive { .. })
    }

    /// `true` while no handle but the store's own refers to this atom.
    pub(crate) fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl Atom<u64> {
    /// Creates an atom mirroring a counter kept outside of any store.
    ///
    /// Every read polls `version`, so dependents are recomputed once it moves
    /// even while nothing is mounted. Mounted dependents still need some other
    /// dependency to be set to learn about a change.
    pub fn versioned<F>(version: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        Self::from_kind(AtomKind::Versioned {
            version: Arc::new(version),
        })
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T> Eq for Atom<T> {}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("primitive", &self.is_primitive())
            .finish()
    }
}

/// An atom with a write function taking `A` and returning `R`.
///
/// Dereferences to its readable [`Atom`], so it can be read and subscribed to
/// like any other atom. Writes go through [`Store::write`].
pub struct WritableAtom<T, A, R = ()> {
    atom: Atom<T>,
    write: Arc<WriteFn<A, R>>,
}

impl<T, A, R> WritableAtom<T, A, R> {
    pub const fn atom(&self) -> &Atom<T> {
        &self.atom
    }

    pub(crate) fn call_write(&self, setter: &Setter<'_>, arg: A) -> R {
        (self.write)(setter, arg)
    }
}

impl<T, A, R> Deref for WritableAtom<T, A, R> {
    type Target = Atom<T>;

    fn deref(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T, A, R> Clone for WritableAtom<T, A, R> {
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
            write: Arc::clone(&self.write),
        }
    }
}

impl<T, A, R> fmt::Debug for WritableAtom<T, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableAtom")
            .field("atom", &self.atom)
            .finish_non_exhaustive()
    }
}

/// Handle given to mount hooks to update their atom.
pub struct AtomSetter<T> {
    store: Store,
    atom: Atom<T>,
}

impl<T> AtomSetter<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn set(&self, value: T) {
        self.store.set(&self.atom, value);
    }

    pub fn get(&self) -> Result<T, AtomError> {
        self.store.get(&self.atom)
    }

    pub const fn store(&self) -> &Store {
        &self.store
    }
}

impl<T> Clone for AtomSetter<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            atom: self.atom.clone(),
        }
    }
}

/// Object-safe view of an atom used by the store for bookkeeping.
pub(crate) trait AnyAtom: Send + Sync {
    fn id(&self) -> AtomId;

    fn label(&self) -> Option<&str>;

    fn is_primitive(&self) -> bool;

    /// Initial value of a primitive atom.
    fn initial(&self) -> Option<Value>;

    /// Evaluates a derived atom.
    fn compute(&self, get: &Getter<'_>) -> Result<Value, AtomError>;

    /// Runs the mount hook, if any.
    fn mount(&self, store: &Store) -> Option<OnUnmount>;

    /// Current external version of a versioned atom.
    fn version(&self) -> Option<u64>;

    fn is_orphaned(&self) -> bool;
}

impl<T> AnyAtom for Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> AtomId {
        self.inner.id
    }

    fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    fn is_primitive(&self) -> bool {
        Atom::is_primitive(self)
    }

    fn initial(&self) -> Option<Value> {
        match &self.inner.kind {
            AtomKind::Primitive { initial, .. } => Some(Arc::new(initial.clone())),
            AtomKind::Derived { .. } | AtomKind::Versioned { .. } => None,
        }
    }

    fn compute(&self, get: &Getter<'_>) -> Result<Value, AtomError> {
        match &self.inner.kind {
            AtomKind::Primitive { initial, .. } => Ok(Arc::new(initial.clone())),
            AtomKind::Derived { read } => read(get).map(|value| Arc::new(value) as Value),
            AtomKind::Versioned { version } => Ok(Arc::new(version())),
        }
    }

    fn mount(&self, store: &Store) -> Option<OnUnmount> {
        match &self.inner.kind {
            AtomKind::Primitive {
                on_mount: Some(on_mount),
                ..
            } => on_mount(AtomSetter {
                store: store.clone(),
                atom: self.clone(),
            }),
            _ => None,
        }
    }

    fn version(&self) -> Option<u64> {
        match &self.inner.kind {
            AtomKind::Versioned { version } => Some(version()),
            _ => None,
        }
    }

    fn is_orphaned(&self) -> bool {
        Atom::is_orphaned(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_ids_are_unique() {
        let a = Atom::new(1);
        let b = Atom::new(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
    }

    #[test]
    fn test_atom_kinds() {
        let primitive = Atom::new("x".to_string());
        let derived = Atom::derived(|_| Ok(0_u8));
        assert!(primitive.is_primitive());
        assert!(!derived.is_primitive());
        assert!(AnyAtom::initial(&primitive).is_some());
        assert!(AnyAtom::initial(&derived).is_none());

        let versioned = Atom::versioned(|| 3);
        assert!(!versioned.is_primitive());
        assert_eq!(AnyAtom::version(&versioned), Some(3));
        assert_eq!(AnyAtom::version(&primitive), None);
    }

    #[test]
    fn test_with_label() {
        let atom = Atom::new(0).with_label("counter");
        assert_eq!(atom.label(), Some("counter"));
    }
}
