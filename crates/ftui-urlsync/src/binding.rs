#![forbid(unsafe_code)]

//! Binding engine: keeps target fields and query parameters in sync.
//!
//! [`UrlSync`] owns the process-wide pieces (URL change bus, key registry,
//! write cache, debounce scheduler). [`UrlSync::bind`] wires one target:
//!
//! 1. resolve and register a handler per field (all or nothing);
//! 2. migrate legacy keys, hydrating from them and removing them in at most
//!    two batched navigations (replace, then push);
//! 3. hydrate each field from its own key;
//! 4. subscribe one listener to the bus for external navigation;
//! 5. observe each field through the [`ReactiveHost`] and write changes
//!    back, debounced per handler policy;
//! 6. observe a reactive prefix, rewriting every key in one navigation.
//!
//! # Invariants
//!
//! 1. A write whose reconstructed query text equals the cached text
//!    produces no navigation.
//! 2. The echo of our own write never re-resolves the field.
//! 3. For multi-entry fields only positions whose raw text changed are
//!    re-resolved.
//! 4. A prefix change is a single replace navigation that removes every old
//!    key and writes every new one.
//! 5. After disposal no callback of the binding touches the URL or the
//!    target; late debounce flushes check key ownership first.
//! 6. The first write of each field (setup) uses replace history.
//!
//! # Failure Modes
//!
//! - Key conflict, invalid debounce, repeated entries for a single key
//!   during hydration: `bind` fails and nothing stays registered.
//! - No History capability: `bind` returns an inert handle whose methods
//!   log and do nothing.
//! - Write failures inside reactive callbacks: logged, not propagated.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;
use url::Url;
use web_time::Instant;

use crate::bus::{BusSubscription, UrlChangeBus, UrlChangeEvent};
use crate::config::{BindOptions, Prefix};
use crate::debounce::{Clock, DebounceScheduler, PageLifecycle, SystemClock};
use crate::error::UrlSyncError;
use crate::handler::{Entries, ParamConfig, ResolvedHandler, resolve_handler};
use crate::history::{History, HistoryMode};
use crate::reactive::{BindTarget, Disposer, ReactiveHost};
use crate::registry::KeyRegistry;
use crate::snapshot::{ParamValue, ParamWrite, UrlSnapshot, fragment_values, query_fragment};

struct SyncInner {
    bus: UrlChangeBus,
    registry: KeyRegistry,
    scheduler: Rc<DebounceScheduler>,
}

/// Top-level coordinator shared by every binding on one page.
///
/// Construct one per history capability; tests construct one per case.
#[derive(Clone)]
pub struct UrlSync {
    inner: Rc<SyncInner>,
}

impl UrlSync {
    #[must_use]
    pub fn new(history: Option<Rc<dyn History>>, clock: Rc<dyn Clock>) -> Self {
        let scheduler = Rc::new(DebounceScheduler::new(clock));
        Self {
            inner: Rc::new(SyncInner {
                bus: UrlChangeBus::new(history),
                registry: KeyRegistry::new(Rc::clone(&scheduler)),
                scheduler,
            }),
        }
    }

    /// Coordinator using wall-clock time.
    #[must_use]
    pub fn with_system_clock(history: Option<Rc<dyn History>>) -> Self {
        Self::new(history, Rc::new(SystemClock))
    }

    #[must_use]
    pub fn bus(&self) -> &UrlChangeBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn registry(&self) -> &KeyRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn scheduler(&self) -> &DebounceScheduler {
        &self.inner.scheduler
    }

    /// History handle that external code should navigate through so its
    /// navigations reach every binding.
    #[must_use]
    pub fn history(&self) -> Option<Rc<dyn History>> {
        self.inner.bus.setup_listener();
        self.inner.bus.history()
    }

    /// When the host should next call [`Self::poll_timers`].
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.scheduler.next_deadline()
    }

    /// Flush debounced writes whose deadline has passed.
    pub fn poll_timers(&self) -> usize {
        self.inner.scheduler.poll()
    }

    /// Flush every pending write when the page is hidden or unloading.
    pub fn handle_lifecycle(&self, event: PageLifecycle) -> usize {
        self.inner.scheduler.handle_lifecycle(event)
    }

    /// Bind `fields` of `target` to query parameters.
    ///
    /// Returns a handle for disposal and prefix updates. The binding is also
    /// disposed when the host's teardown scope ends (or through
    /// `options.on_destroy` when set).
    ///
    /// # Errors
    ///
    /// - [`UrlSyncError::InvalidDebounce`] for malformed debounce bounds.
    /// - [`UrlSyncError::KeyConflict`] when a key is already bound.
    /// - [`UrlSyncError::EntriesMismatch`] when the URL repeats a single key.
    pub fn bind<F, K>(
        &self,
        target: Rc<dyn BindTarget>,
        host: Rc<dyn ReactiveHost>,
        fields: F,
        options: BindOptions,
    ) -> Result<BindingHandle, UrlSyncError>
    where
        F: IntoIterator<Item = (K, ParamConfig)>,
        K: Into<String>,
    {
        if !self.inner.bus.setup_listener() {
            tracing::error!("history capability unavailable; binding is inert");
            return Ok(BindingHandle::inert());
        }
        options.validate()?;

        let prefix = options.prefix.current();
        let mut bound = Vec::new();
        for (name, config) in fields {
            config.validate()?;
            let name: String = name.into();
            let handler = Rc::new(resolve_handler(&name, &config, &options, &prefix));
            bound.push(BoundField {
                name,
                config,
                handler,
            });
        }
        let handlers: Vec<Rc<ResolvedHandler>> =
            bound.iter().map(|f| Rc::clone(&f.handler)).collect();
        self.inner.registry.register_all(&handlers)?;

        let state = Rc::new(BindingState {
            sync: Rc::clone(&self.inner),
            target,
            options,
            prefix: RefCell::new(prefix),
            fields: RefCell::new(bound),
            observers: RefCell::new(Vec::new()),
            listener: RefCell::new(None),
            keepalive: RefCell::new(Weak::new()),
            disposed: Cell::new(false),
        });

        if let Err(err) = state.hydrate() {
            state.dispose();
            return Err(err);
        }

        let weak = Rc::downgrade(&state);
        let subscription = self.inner.bus.subscribe(move |event| match weak.upgrade() {
            Some(state) => state.on_navigation(event),
            None => Ok(()),
        });
        *state.listener.borrow_mut() = Some(subscription);

        for index in 0..handlers.len() {
            let disposer = host.observe(BindingState::field_observer(&state, index));
            state.observers.borrow_mut().push(disposer);
        }
        if let Prefix::Reactive(getter) = &state.options.prefix {
            let disposer = host.observe(BindingState::prefix_observer(&state, Rc::clone(getter)));
            state.observers.borrow_mut().push(disposer);
        }

        // The teardown scope keeps the binding alive until it is disposed.
        let keepalive: Keepalive = Rc::new(RefCell::new(Some(Rc::clone(&state))));
        *state.keepalive.borrow_mut() = Rc::downgrade(&keepalive);
        let disposer: Box<dyn FnOnce()> = Box::new(move || {
            let state = keepalive.borrow_mut().take();
            if let Some(state) = state {
                state.dispose();
            }
        });
        match &state.options.on_destroy {
            Some(register) => register(disposer),
            None => host.on_teardown(disposer),
        }

        tracing::debug!(keys = ?state.keys(), "query binding established");
        Ok(BindingHandle { state: Some(state) })
    }
}

impl std::fmt::Debug for UrlSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSync")
            .field("bus", &self.inner.bus)
            .field("registry", &self.inner.registry)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-binding state
// ---------------------------------------------------------------------------

struct BoundField {
    name: String,
    config: ParamConfig,
    handler: Rc<ResolvedHandler>,
}

type Keepalive = Rc<RefCell<Option<Rc<BindingState>>>>;

struct BindingState {
    sync: Rc<SyncInner>,
    target: Rc<dyn BindTarget>,
    options: BindOptions,
    prefix: RefCell<String>,
    fields: RefCell<Vec<BoundField>>,
    observers: RefCell<Vec<Disposer>>,
    listener: RefCell<Option<BusSubscription>>,
    keepalive: RefCell<Weak<RefCell<Option<Rc<BindingState>>>>>,
    disposed: Cell<bool>,
}

impl BindingState {
    fn handlers(&self) -> Vec<Rc<ResolvedHandler>> {
        self.fields
            .borrow()
            .iter()
            .map(|f| Rc::clone(&f.handler))
            .collect()
    }

    fn handler_at(&self, index: usize) -> Option<Rc<ResolvedHandler>> {
        self.fields.borrow().get(index).map(|f| Rc::clone(&f.handler))
    }

    fn keys(&self) -> Vec<String> {
        self.fields
            .borrow()
            .iter()
            .map(|f| f.handler.key.clone())
            .collect()
    }

    fn is_live(&self, handler: &Rc<ResolvedHandler>) -> bool {
        !self.disposed.get() && self.sync.registry.is_owned_by(&handler.key, handler)
    }

    // -- read path ----------------------------------------------------------

    fn hydrate(&self) -> Result<(), UrlSyncError> {
        let snapshot = self
            .sync
            .bus
            .snapshot()
            .ok_or(UrlSyncError::HistoryUnavailable)?;
        let mut replace_removals = Vec::new();
        let mut push_removals = Vec::new();

        for handler in self.handlers() {
            for legacy in &handler.legacy_keys {
                let legacy_key = legacy.key();
                let Some(value) = snapshot.get(&legacy_key) else {
                    continue;
                };
                if legacy.apply_on_hydrate {
                    let next = self.decode_param(&handler, value, None)?;
                    tracing::debug!(legacy = %legacy_key, key = %handler.key, "hydrating from legacy key");
                    self.target.set(&handler.field, next);
                }
                if legacy.remove {
                    let removal = ParamWrite::delete(legacy_key);
                    match legacy.removal_history {
                        HistoryMode::Replace => replace_removals.push(removal),
                        HistoryMode::Push => push_removals.push(removal),
                    }
                }
            }

            // An absent key leaves the field's initial value in place.
            if let Some(value) = snapshot.get(&handler.key) {
                self.sync_from_url(&handler, Some(value))?;
            }
        }

        self.sync.bus.apply_batch(&replace_removals, HistoryMode::Replace)?;
        self.sync.bus.apply_batch(&push_removals, HistoryMode::Push)?;
        Ok(())
    }

    fn on_navigation(&self, event: &UrlChangeEvent) -> Result<(), UrlSyncError> {
        if self.disposed.get() {
            return Ok(());
        }
        let mut first_err = None;
        for handler in self.handlers() {
            if let Err(err) = self.sync_from_url(&handler, event.snapshot.get(&handler.key)) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bring one field up to date with the URL value for its key.
    fn sync_from_url(
        &self,
        handler: &Rc<ResolvedHandler>,
        value: Option<&ParamValue>,
    ) -> Result<(), UrlSyncError> {
        if !self.is_live(handler) {
            return Ok(());
        }
        let registry = &self.sync.registry;
        let fragment = query_fragment(&handler.key, value);
        let cached = registry.read_cached(&handler.key);
        if fragment == cached {
            tracing::trace!(key = %handler.key, "url value unchanged");
            return Ok(());
        }

        match value {
            None => {
                registry.drop_cached(&handler.key);
                if handler.entries == Entries::Multiple {
                    self.target.set(&handler.field, Value::Array(Vec::new()));
                }
            }
            Some(value) => {
                let next = self.decode_param(handler, value, cached.as_deref())?;
                registry.set_cached(&handler.key, fragment);
                tracing::trace!(key = %handler.key, "field updated from url");
                self.target.set(&handler.field, next);
            }
        }
        Ok(())
    }

    /// Field value for `value`. For multi-entry fields, positions whose raw
    /// text matches `cached` keep their current element.
    fn decode_param(
        &self,
        handler: &ResolvedHandler,
        value: &ParamValue,
        cached: Option<&str>,
    ) -> Result<Value, UrlSyncError> {
        match (handler.entries, value) {
            (Entries::Single, ParamValue::Single(raw)) => Ok(handler.read_value(raw, None)),
            (Entries::Single, ParamValue::Multiple(values)) => Err(UrlSyncError::EntriesMismatch {
                key: handler.key.clone(),
                count: values.len(),
            }),
            (Entries::Multiple, value) => {
                let previous = cached.map(fragment_values).unwrap_or_default();
                let current = match self.target.get_untracked(&handler.field) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                let items = value
                    .values()
                    .into_iter()
                    .enumerate()
                    .map(|(i, raw)| match (previous.get(i), current.get(i)) {
                        (Some(prev), Some(existing)) if prev == raw => existing.clone(),
                        _ => handler.read_value(raw, Some(i)),
                    })
                    .collect();
                Ok(Value::Array(items))
            }
        }
    }

    // -- write path ---------------------------------------------------------

    fn field_observer(state: &Rc<Self>, index: usize) -> Box<dyn FnMut()> {
        let weak = Rc::downgrade(state);
        let mut first_run = true;
        Box::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            if state.disposed.get() {
                return;
            }
            let Some(handler) = state.handler_at(index) else {
                return;
            };
            let value = state.target.get(&handler.field).unwrap_or(Value::Null);
            if std::mem::take(&mut first_run) {
                state.commit(&handler, &value, HistoryMode::Replace);
            } else {
                Self::schedule_write(&state, handler, value);
            }
        })
    }

    fn schedule_write(state: &Rc<Self>, handler: Rc<ResolvedHandler>, value: Value) {
        match handler.effective_debounce(state.options.debounce) {
            None => state.commit(&handler, &value, handler.history),
            Some(config) => {
                let weak = Rc::downgrade(state);
                let key = handler.key.clone();
                state.sync.scheduler.enqueue(
                    &key,
                    move || {
                        if let Some(state) = weak.upgrade() {
                            state.commit(&handler, &value, handler.history);
                        }
                    },
                    config,
                );
            }
        }
    }

    fn commit(&self, handler: &Rc<ResolvedHandler>, value: &Value, mode: HistoryMode) {
        if let Err(err) = self.write_to_url(handler, value, mode) {
            tracing::error!(key = %handler.key, %err, "query write failed");
        }
    }

    fn write_to_url(
        &self,
        handler: &Rc<ResolvedHandler>,
        value: &Value,
        mode: HistoryMode,
    ) -> Result<(), UrlSyncError> {
        if !self.is_live(handler) {
            return Ok(());
        }
        let registry = &self.sync.registry;
        let wire = handler.to_wire(value);
        let fragment = query_fragment(&handler.key, wire.as_ref());
        let previous = registry.read_cached(&handler.key);
        if previous == fragment {
            tracing::trace!(key = %handler.key, "write suppressed; value unchanged");
            return Ok(());
        }
        let before = self.sync.bus.location();
        // Cache first so the broadcast of this navigation reads as our echo.
        registry.set_cached(&handler.key, fragment);
        if let Err(err) = self.sync.bus.apply_navigation(&handler.key, wire, mode) {
            if self.sync.bus.location() == before {
                registry.set_cached(&handler.key, previous);
            }
            return Err(err);
        }
        Ok(())
    }

    // -- prefix -------------------------------------------------------------

    fn prefix_observer(state: &Rc<Self>, getter: Rc<dyn Fn() -> String>) -> Box<dyn FnMut()> {
        let weak = Rc::downgrade(state);
        Box::new(move || {
            let next = getter();
            let Some(state) = weak.upgrade() else {
                return;
            };
            if let Err(err) = state.set_prefix(next) {
                tracing::error!(%err, "prefix change rejected");
            }
        })
    }

    fn set_prefix(&self, next: String) -> Result<(), UrlSyncError> {
        if self.disposed.get() || *self.prefix.borrow() == next {
            return Ok(());
        }
        let registry = &self.sync.registry;
        let old = self.handlers();
        let old_cache: Vec<Option<String>> =
            old.iter().map(|h| registry.read_cached(&h.key)).collect();
        for handler in &old {
            registry.unregister(&handler.key);
        }

        let renamed: Vec<Rc<ResolvedHandler>> = self
            .fields
            .borrow()
            .iter()
            .map(|f| Rc::new(resolve_handler(&f.name, &f.config, &self.options, &next)))
            .collect();
        if let Err(err) = registry.register_all(&renamed) {
            self.reclaim(&old, old_cache);
            return Err(err);
        }

        let mut writes: Vec<ParamWrite> = old.iter().map(|h| ParamWrite::delete(&h.key)).collect();
        for handler in &renamed {
            let value = self.target.get_untracked(&handler.field).unwrap_or(Value::Null);
            let wire = handler.to_wire(&value);
            registry.set_cached(&handler.key, query_fragment(&handler.key, wire.as_ref()));
            writes.push(ParamWrite {
                key: handler.key.clone(),
                value: wire,
            });
        }
        for (field, handler) in self.fields.borrow_mut().iter_mut().zip(renamed.iter()) {
            field.handler = Rc::clone(handler);
        }
        let previous = self.prefix.replace(next);
        tracing::debug!(from = %previous, to = %self.prefix.borrow(), "query prefix changed");

        let before = self.sync.bus.location();
        if let Err(err) = self.sync.bus.apply_batch(&writes, HistoryMode::Replace) {
            if self.sync.bus.location() == before {
                tracing::warn!(%err, prefix = %previous, "prefix navigation failed; restoring keys");
                for handler in &renamed {
                    registry.unregister(&handler.key);
                }
                self.reclaim(&old, old_cache);
                for (field, handler) in self.fields.borrow_mut().iter_mut().zip(old) {
                    field.handler = handler;
                }
                *self.prefix.borrow_mut() = previous;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Re-register released handlers along with their cached fragments.
    fn reclaim(&self, handlers: &[Rc<ResolvedHandler>], cache: Vec<Option<String>>) {
        let registry = &self.sync.registry;
        for (handler, cached) in handlers.iter().zip(cache) {
            if let Err(err) = registry.register(handler) {
                tracing::error!(key = %handler.key, %err, "could not reclaim query key");
                continue;
            }
            registry.set_cached(&handler.key, cached);
        }
    }

    // -- teardown -----------------------------------------------------------

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let keepalive = self.keepalive.borrow().upgrade();
        let anchored = keepalive.as_ref().and_then(|slot| slot.borrow_mut().take());
        let observers = std::mem::take(&mut *self.observers.borrow_mut());
        drop(observers);
        self.listener.borrow_mut().take();
        for handler in self.handlers() {
            if self.sync.registry.is_owned_by(&handler.key, &handler) {
                self.sync.registry.unregister(&handler.key);
            }
        }
        tracing::debug!(keys = ?self.keys(), "query binding disposed");
        drop(anchored);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to an established binding.
///
/// Dropping the handle does not dispose the binding; the host's teardown
/// scope (or `on_destroy`) owns its lifetime.
#[derive(Clone)]
pub struct BindingHandle {
    state: Option<Rc<BindingState>>,
}

impl BindingHandle {
    fn inert() -> Self {
        Self { state: None }
    }

    /// Whether the binding is live (not inert, not disposed).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.disposed.get())
    }

    /// Whether the binding degraded to a no-op for lack of history.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.state.is_none()
    }

    /// Unsubscribe, release every key and cancel pending writes. Idempotent.
    pub fn dispose(&self) {
        match &self.state {
            Some(state) => state.dispose(),
            None => tracing::error!("dispose called on inert query binding"),
        }
    }

    /// Move every bound key under `prefix` in one replace navigation.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::KeyConflict`] when a renamed key is owned elsewhere;
    /// the old keys stay bound.
    pub fn set_prefix(&self, prefix: impl Into<String>) -> Result<(), UrlSyncError> {
        match &self.state {
            Some(state) => state.set_prefix(prefix.into()),
            None => {
                tracing::error!("set_prefix called on inert query binding");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn prefix(&self) -> Option<String> {
        self.state.as_ref().map(|s| s.prefix.borrow().clone())
    }

    /// Escaped keys currently owned, in field order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.as_ref().map(|s| s.keys()).unwrap_or_default()
    }

    /// Current location, when a history capability exists.
    #[must_use]
    pub fn location(&self) -> Option<Url> {
        self.state.as_ref().and_then(|s| s.sync.bus.location())
    }

    /// Snapshot of the current location.
    #[must_use]
    pub fn snapshot(&self) -> Option<UrlSnapshot> {
        self.state.as_ref().and_then(|s| s.sync.bus.snapshot())
    }
}

impl std::fmt::Debug for BindingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingHandle")
            .field("inert", &self.is_inert())
            .field("active", &self.is_active())
            .field("keys", &self.keys())
            .finish()
    }
}
