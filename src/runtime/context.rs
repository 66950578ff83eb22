//! Contexts: lifetime scopes for groups of fibers.
//!
//! Every fiber belongs to exactly one context. A context is created inert,
//! activated once, gathers every fiber spawned within it, and terminates when
//! its live-fiber set empties. [`run`](super::run) drives the loop until the
//! context it created is terminal, so a parent never completes before the
//! fibers it spawned.
//!
//! A context also carries the unhandled-exception slot (a panic escaping a
//! fiber nobody awaits lands here and is re-raised by `run`) and a small
//! key/value store for user-scoped state, addressable by integer, string or
//! object identity.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::fiber::{FiberId, JoinError, PanicPayload};

////////////////////////////////////////////////////////////////////////////////
// Context
////////////////////////////////////////////////////////////////////////////////

/// A lifetime scope for a group of fibers with a shared unhandled-exception
/// sink. Cloning the handle is cheap and shares the scope.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

pub(crate) enum Unhandled {
    Panic(PanicPayload),
    Deadlock,
}

struct ContextInner {
    activated: Cell<bool>,
    // live fibers with their start times
    fibers: RefCell<HashMap<FiberId, Instant>>,
    unhandled: RefCell<Option<Unhandled>>,
    store: RefCell<HashMap<ContextKey, Box<dyn Any>>>,
}

impl Context {
    /// Creates an inert context. It accepts fibers only after
    /// [`activate`](Self::activate).
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ContextInner {
                activated: Cell::new(false),
                fibers: RefCell::new(HashMap::new()),
                unhandled: RefCell::new(None),
                store: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The context of the currently running fiber, or the context the
    /// innermost [`run`](super::run) is driving when called between fibers.
    pub fn current() -> Option<Context> {
        super::driver().and_then(|d| d.current_context())
    }

    /// Marks the context live. Contexts are single-use: a second activation
    /// fails with [`Error::ContextReused`].
    pub fn activate(&self) -> Result<()> {
        if self.inner.activated.replace(true) {
            return Err(Error::ContextReused);
        }
        Ok(())
    }

    pub(crate) fn is_activated(&self) -> bool {
        self.inner.activated.get()
    }

    /// An activated context whose fiber set has emptied. `run` returns only
    /// once the context it drives is terminal.
    pub fn is_terminal(&self) -> bool {
        self.inner.activated.get() && self.inner.fibers.borrow().is_empty()
    }

    /// Number of live fibers in this context.
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    pub(crate) fn add_fiber(&self, id: FiberId, started_at: Instant) {
        self.inner.fibers.borrow_mut().insert(id, started_at);
    }

    pub(crate) fn remove_fiber(&self, id: FiberId) {
        self.inner.fibers.borrow_mut().remove(&id);
    }

    /// Records a failure nobody awaited. The first one is kept for `run` to
    /// re-raise; the rest go to the exception log.
    pub(crate) fn report_unhandled(&self, error: &JoinError) {
        let unhandled = match error {
            JoinError::Panicked(payload) => Unhandled::Panic(payload.clone()),
            JoinError::Deadlock => Unhandled::Deadlock,
        };
        let mut slot = self.inner.unhandled.borrow_mut();
        if slot.is_none() {
            *slot = Some(unhandled);
        } else {
            log::error!("unhandled fiber exception dropped (context already holds one): {error}");
        }
    }

    pub(crate) fn take_unhandled(&self) -> Option<Unhandled> {
        self.inner.unhandled.borrow_mut().take()
    }

    ////////////////////////////////////////////////////////////////////////////
    // key/value store
    ////////////////////////////////////////////////////////////////////////////

    /// Stores a value under `key`, replacing any previous value.
    pub fn set<V: 'static>(&self, key: impl Into<ContextKey>, value: V) {
        self.inner
            .store
            .borrow_mut()
            .insert(key.into(), Box::new(value));
    }

    /// Clones the value stored under `key` out of the context.
    pub fn get<V: Clone + 'static>(&self, key: impl Into<ContextKey>) -> Option<V> {
        self.inner
            .store
            .borrow()
            .get(&key.into())
            .and_then(|v| v.downcast_ref::<V>())
            .cloned()
    }

    /// Removes and returns the value stored under `key`.
    pub fn take<V: 'static>(&self, key: impl Into<ContextKey>) -> Option<V> {
        let boxed = self.inner.store.borrow_mut().remove(&key.into())?;
        boxed.downcast::<V>().ok().map(|v| *v)
    }

    pub fn contains(&self, key: impl Into<ContextKey>) -> bool {
        self.inner.store.borrow().contains_key(&key.into())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("activated", &self.inner.activated.get())
            .field("fibers", &self.inner.fibers.borrow().len())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// ContextKey
////////////////////////////////////////////////////////////////////////////////

/// Key into a context's user store: a scalar or the identity of a shared
/// object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Int(i64),
    Str(String),
    Identity(usize),
}

impl ContextKey {
    /// A key derived from the identity of `value`, not its contents. Two
    /// clones of the same `Rc` produce the same key.
    pub fn identity<T>(value: &Rc<T>) -> Self {
        Self::Identity(Rc::as_ptr(value) as usize)
    }
}

impl From<i64> for ContextKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ContextKey {
    fn from(v: &str) -> Self {
        Self::Str(v.into())
    }
}

impl From<String> for ContextKey {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}
