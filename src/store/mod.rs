//! Dependency-tracked atoms and the store that evaluates them.
//!
//! An [`Atom`] describes a cell; a [`Store`] holds its value. Derived atoms
//! read other atoms through a [`Getter`] and are recomputed when one of those
//! dependencies changes. Subscribing with [`Store::sub`] *mounts* an atom and
//! its dependencies, which runs primitive atoms' mount hooks.
//!
//! A read can also fail without a value: it either suspends with a
//! [`Suspense`] to wait on, or throws a query error. Both travel as
//! [`AtomError`](crate::AtomError) through `?`.
//!
//! # Example
//!
//! ```rust
//! use query_atoms::store::{Atom, Store};
//!
//! let store = Store::new();
//! let name = Atom::new("world".to_string());
//! let greeting = {
//!     let name = name.clone();
//!     Atom::derived(move |get| Ok(format!("hello {}", get.get(&name)?)))
//! };
//!
//! let _subscription = store.sub(&greeting, || println!("greeting changed"));
//! store.set(&name, "atoms".to_string());
//! assert_eq!(store.get(&greeting).ok().as_deref(), Some("hello atoms"));
//! ```

mod atom;
mod runtime;
mod suspense;

pub use atom::{Atom, AtomId, AtomSetter, OnUnmount, WritableAtom};
pub use runtime::{Getter, Setter, Store, StoreId, Unsubscribe, WeakStore};
pub use suspense::Suspense;
