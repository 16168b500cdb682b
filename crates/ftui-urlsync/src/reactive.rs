#![forbid(unsafe_code)]

//! Reactive collaborator interface and a small tick-based implementation.
//!
//! The binding engine only needs two capabilities from the host's reactive
//! system, expressed by [`ReactiveHost`]:
//!
//! - `observe(read)`: run `read` now, then once per tick after any value it
//!   read has changed.
//! - `on_teardown(callback)`: run `callback` when the owning scope ends.
//!
//! Field access goes through [`BindTarget`]. Any framework satisfying these
//! traits can host bindings; [`Runtime`] and [`Store`] are the in-crate
//! implementation used by tests and simple hosts.
//!
//! # Invariants
//!
//! 1. An observer runs at most once per [`Runtime::tick`], however many of
//!    its dependencies changed.
//! 2. Setting a field to an equal value is a no-op (no version bump, no
//!    notification).
//! 3. Field writes never run observers synchronously.
//! 4. Dropping a [`Disposer`] removes the observer before the next tick;
//!    a [`Store`] prunes it when the field is next written or gains a
//!    new subscriber.
//! 5. Teardown callbacks run in reverse registration order.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashSet;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

/// Ticks [`Runtime::run_until_idle`] runs before giving up on a feedback loop.
const MAX_IDLE_TICKS: usize = 64;

/// RAII guard returned by [`ReactiveHost::observe`]. Dropping it
/// unsubscribes.
#[must_use = "dropping a Disposer unsubscribes immediately"]
pub struct Disposer {
    dispose: Option<Box<dyn FnOnce()>>,
}

impl Disposer {
    pub fn new(dispose: impl FnOnce() + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A disposer with nothing to release.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// Release now.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.dispose.is_some())
            .finish()
    }
}

/// Change tracking the binding engine consumes.
pub trait ReactiveHost {
    /// Run `read` immediately and again on the tick after any value it read
    /// changes.
    fn observe(&self, read: Box<dyn FnMut()>) -> Disposer;

    /// Run `callback` when the owning scope ends.
    fn on_teardown(&self, callback: Box<dyn FnOnce()>);
}

/// The host object whose fields are bound to query parameters.
pub trait BindTarget {
    /// Current value of `field`. Reads inside an observer are tracked.
    fn get(&self, field: &str) -> Option<Value>;

    /// Current value of `field` without subscribing the running observer.
    fn get_untracked(&self, field: &str) -> Option<Value>;

    fn set(&self, field: &str, value: Value);
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

type ObserverId = u64;
type ReadFn = Rc<RefCell<Box<dyn FnMut()>>>;

struct RuntimeInner {
    observers: RefCell<IndexMap<ObserverId, ReadFn>>,
    dirty: RefCell<IndexSet<ObserverId>>,
    active: RefCell<Vec<ObserverId>>,
    teardown: RefCell<Vec<Box<dyn FnOnce()>>>,
    next_id: Cell<ObserverId>,
}

/// Tick-driven observer scheduler implementing [`ReactiveHost`].
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                observers: RefCell::new(IndexMap::new()),
                dirty: RefCell::new(IndexSet::new()),
                active: RefCell::new(Vec::new()),
                teardown: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Run every observer marked dirty since the last tick, once each.
    ///
    /// Returns the number of observers run.
    pub fn tick(&self) -> usize {
        let dirty: Vec<ObserverId> = self.inner.dirty.borrow_mut().drain(..).collect();
        let mut ran = 0;
        for id in dirty {
            if self.run(id) {
                ran += 1;
            }
        }
        ran
    }

    /// Tick until no observer is dirty.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_IDLE_TICKS {
            let ran = self.tick();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
        tracing::warn!(ticks = MAX_IDLE_TICKS, "reactive runtime did not settle");
        total
    }

    /// End the scope: run teardown callbacks, most recent first.
    pub fn teardown(&self) {
        let callbacks = std::mem::take(&mut *self.inner.teardown.borrow_mut());
        for callback in callbacks.into_iter().rev() {
            callback();
        }
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observers.borrow().len()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.inner.dirty.borrow().is_empty()
    }

    fn is_live(&self, id: ObserverId) -> bool {
        self.inner.observers.borrow().contains_key(&id)
    }

    fn current_observer(&self) -> Option<ObserverId> {
        self.inner.active.borrow().last().copied()
    }

    fn mark_dirty(&self, ids: impl IntoIterator<Item = ObserverId>) {
        let observers = self.inner.observers.borrow();
        let mut dirty = self.inner.dirty.borrow_mut();
        for id in ids {
            if observers.contains_key(&id) {
                dirty.insert(id);
            }
        }
    }

    fn run(&self, id: ObserverId) -> bool {
        let Some(read) = self.inner.observers.borrow().get(&id).cloned() else {
            return false;
        };
        self.inner.active.borrow_mut().push(id);
        {
            let mut read = read.borrow_mut();
            (*read)();
        }
        self.inner.active.borrow_mut().pop();
        true
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveHost for Runtime {
    fn observe(&self, read: Box<dyn FnMut()>) -> Disposer {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .observers
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(read)));
        self.run(id);

        let weak: Weak<RuntimeInner> = Rc::downgrade(&self.inner);
        Disposer::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.borrow_mut().shift_remove(&id);
                inner.dirty.borrow_mut().shift_remove(&id);
            }
        })
    }

    fn on_teardown(&self, callback: Box<dyn FnOnce()>) {
        self.inner.teardown.borrow_mut().push(callback);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("observers", &self.observer_count())
            .field("pending", &self.inner.dirty.borrow().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct FieldSlot {
    value: Value,
    version: u64,
    subscribers: AHashSet<ObserverId>,
}

impl FieldSlot {
    fn new(value: Value) -> Self {
        Self {
            value,
            version: 0,
            subscribers: AHashSet::new(),
        }
    }
}

/// Named reactive fields implementing [`BindTarget`].
pub struct Store {
    runtime: Runtime,
    fields: RefCell<IndexMap<String, FieldSlot>>,
}

impl Store {
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            fields: RefCell::new(IndexMap::new()),
        }
    }

    /// Builder-style field declaration.
    #[must_use]
    pub fn with_field(self, name: impl Into<String>, value: Value) -> Self {
        self.fields
            .borrow_mut()
            .insert(name.into(), FieldSlot::new(value));
        self
    }

    /// Mutate a field in place (e.g. push onto an array) and notify if the
    /// value changed.
    pub fn update(&self, field: &str, f: impl FnOnce(&mut Value)) {
        let mut value = self.peek(field).unwrap_or(Value::Null);
        f(&mut value);
        self.set(field, value);
    }

    /// Read without tracking.
    #[must_use]
    pub fn peek(&self, field: &str) -> Option<Value> {
        self.fields.borrow().get(field).map(|slot| slot.value.clone())
    }

    /// Number of effective changes to `field`.
    #[must_use]
    pub fn version(&self, field: &str) -> u64 {
        self.fields.borrow().get(field).map_or(0, |slot| slot.version)
    }
}

impl BindTarget for Store {
    fn get(&self, field: &str) -> Option<Value> {
        let observer = self.runtime.current_observer();
        let mut fields = self.fields.borrow_mut();
        let slot = fields.get_mut(field)?;
        if let Some(id) = observer {
            if slot.subscribers.insert(id) {
                slot.subscribers.retain(|&id| self.runtime.is_live(id));
            }
        }
        Some(slot.value.clone())
    }

    fn get_untracked(&self, field: &str) -> Option<Value> {
        self.peek(field)
    }

    fn set(&self, field: &str, value: Value) {
        let notify: Vec<ObserverId> = {
            let mut fields = self.fields.borrow_mut();
            let slot = fields
                .entry(field.to_owned())
                .or_insert_with(|| FieldSlot::new(Value::Null));
            if slot.value == value {
                return;
            }
            slot.value = value;
            slot.version += 1;
            slot.subscribers.retain(|&id| self.runtime.is_live(id));
            slot.subscribers.iter().copied().collect()
        };
        self.runtime.mark_dirty(notify);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.fields.borrow();
        f.debug_map()
            .entries(fields.iter().map(|(k, slot)| (k, &slot.value)))
            .finish()
    }
}
