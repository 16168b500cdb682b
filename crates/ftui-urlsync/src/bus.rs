#![forbid(unsafe_code)]

//! URL change bus: one channel for every navigation, however it was issued.
//!
//! [`UrlChangeBus::setup_listener`] wraps the host [`History`] in an
//! [`InterceptedHistory`] decorator. Every `push_state` / `replace_state`
//! through the decorator performs the original mutation, then parses the new
//! location into a [`UrlSnapshot`] and broadcasts it. Back/forward
//! navigation is observed through [`History::on_pop_state`]. External code
//! that wants its navigations seen by bindings navigates through
//! [`UrlChangeBus::history`].
//!
//! # Invariants
//!
//! 1. Interception is installed at most once per bus and never removed.
//! 2. The original history entry points are always invoked before any
//!    listener runs.
//! 3. Listeners are notified in subscription order with the same snapshot.
//! 4. Dropping a [`BusSubscription`] removes its listener before the next
//!    broadcast.
//! 5. A batch of edits produces at most one history commit.
//!
//! # Failure Modes
//!
//! - No History capability: `setup_listener()` returns `false`; navigation
//!   methods return [`UrlSyncError::HistoryUnavailable`].
//! - Listener error: remaining listeners still run; the first error is
//!   returned to whoever triggered the navigation.
//! - Malformed foreign payload: logged and dropped.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;
use url::Url;

use crate::error::UrlSyncError;
use crate::history::{History, HistoryMode, PopStateListener};
use crate::snapshot::{ParamValue, ParamWrite, UrlSnapshot, apply_writes};

/// What caused a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationSource {
    Push,
    Replace,
    PopState,
    /// A payload posted by foreign code via [`UrlChangeBus::dispatch_payload`].
    External,
}

impl From<HistoryMode> for NavigationSource {
    fn from(mode: HistoryMode) -> Self {
        match mode {
            HistoryMode::Push => Self::Push,
            HistoryMode::Replace => Self::Replace,
        }
    }
}

/// Notification payload delivered to every listener.
#[derive(Debug, Clone)]
pub struct UrlChangeEvent {
    pub source: NavigationSource,
    pub snapshot: Rc<UrlSnapshot>,
}

type Listener = dyn Fn(&UrlChangeEvent) -> Result<(), UrlSyncError>;

struct BusInner {
    native: Option<Rc<dyn History>>,
    intercepted: RefCell<Option<Rc<InterceptedHistory>>>,
    listeners: RefCell<Vec<(u64, Rc<Listener>)>>,
    next_id: Cell<u64>,
}

impl BusInner {
    fn broadcast_location(&self, source: NavigationSource) -> Result<(), UrlSyncError> {
        let Some(native) = &self.native else {
            return Err(UrlSyncError::HistoryUnavailable);
        };
        let snapshot = UrlSnapshot::from_url(&native.location());
        self.broadcast(UrlChangeEvent {
            source,
            snapshot: Rc::new(snapshot),
        })
    }

    fn broadcast(&self, event: UrlChangeEvent) -> Result<(), UrlSyncError> {
        // Listeners may subscribe, unsubscribe or navigate while running.
        let listeners: Vec<Rc<Listener>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        tracing::trace!(
            source = ?event.source,
            listeners = listeners.len(),
            params = event.snapshot.len(),
            "url change broadcast"
        );
        let mut first_err = None;
        for listener in listeners {
            if let Err(err) = listener(&event) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// History decorator that broadcasts after every mutation.
pub struct InterceptedHistory {
    native: Rc<dyn History>,
    bus: Weak<BusInner>,
}

impl InterceptedHistory {
    fn after_mutation(&self, source: NavigationSource) -> Result<(), UrlSyncError> {
        match self.bus.upgrade() {
            Some(bus) => bus.broadcast_location(source),
            None => Ok(()),
        }
    }
}

impl History for InterceptedHistory {
    fn location(&self) -> Url {
        self.native.location()
    }

    fn push_state(&self, url: &Url) -> Result<(), UrlSyncError> {
        self.native.push_state(url)?;
        self.after_mutation(NavigationSource::Push)
    }

    fn replace_state(&self, url: &Url) -> Result<(), UrlSyncError> {
        self.native.replace_state(url)?;
        self.after_mutation(NavigationSource::Replace)
    }

    fn on_pop_state(&self, listener: PopStateListener) {
        self.native.on_pop_state(listener);
    }
}

impl std::fmt::Debug for InterceptedHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedHistory")
            .field("location", &self.native.location().as_str())
            .finish()
    }
}

/// RAII guard for a bus listener. Dropping it unsubscribes.
#[must_use = "dropping a BusSubscription unsubscribes immediately"]
pub struct BusSubscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("id", &self.id)
            .finish()
    }
}

/// Process-wide URL change channel.
#[derive(Clone)]
pub struct UrlChangeBus {
    inner: Rc<BusInner>,
}

impl UrlChangeBus {
    /// Create an uninstalled bus over an optional History capability.
    #[must_use]
    pub fn new(history: Option<Rc<dyn History>>) -> Self {
        Self {
            inner: Rc::new(BusInner {
                native: history,
                intercepted: RefCell::new(None),
                listeners: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// Install history interception. Idempotent.
    ///
    /// Returns `false` when the host has no History capability.
    pub fn setup_listener(&self) -> bool {
        if self.is_installed() {
            return true;
        }
        let Some(native) = &self.inner.native else {
            tracing::warn!("history capability unavailable; url bus not installed");
            return false;
        };

        let weak = Rc::downgrade(&self.inner);
        native.on_pop_state(Rc::new(move || {
            let Some(bus) = weak.upgrade() else {
                return;
            };
            if let Err(err) = bus.broadcast_location(NavigationSource::PopState) {
                tracing::error!(%err, "pop-state broadcast failed");
            }
        }));

        *self.inner.intercepted.borrow_mut() = Some(Rc::new(InterceptedHistory {
            native: Rc::clone(native),
            bus: Rc::downgrade(&self.inner),
        }));
        tracing::debug!("url bus installed");
        true
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.inner.intercepted.borrow().is_some()
    }

    /// The intercepted history handle, once installed.
    #[must_use]
    pub fn history(&self) -> Option<Rc<dyn History>> {
        self.intercepted().map(|h| h as Rc<dyn History>)
    }

    /// Snapshot of the current location.
    #[must_use]
    pub fn snapshot(&self) -> Option<UrlSnapshot> {
        self.inner
            .native
            .as_ref()
            .map(|h| UrlSnapshot::from_url(&h.location()))
    }

    /// Current location.
    #[must_use]
    pub fn location(&self) -> Option<Url> {
        self.inner.native.as_ref().map(|h| h.location())
    }

    /// Register a listener for every broadcast.
    pub fn subscribe(
        &self,
        listener: impl Fn(&UrlChangeEvent) -> Result<(), UrlSyncError> + 'static,
    ) -> BusSubscription {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));
        BusSubscription {
            bus: Rc::downgrade(&self.inner),
            id,
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Write one parameter. `None` deletes it.
    ///
    /// Returns whether a commit happened.
    ///
    /// # Errors
    ///
    /// History failures and listener errors raised by the broadcast.
    pub fn apply_navigation(
        &self,
        key: &str,
        value: Option<ParamValue>,
        mode: HistoryMode,
    ) -> Result<bool, UrlSyncError> {
        self.apply_batch(
            &[ParamWrite {
                key: key.to_owned(),
                value,
            }],
            mode,
        )
    }

    /// Apply every edit to one URL and commit it once.
    ///
    /// Returns whether a commit happened; edits that leave the URL unchanged
    /// commit nothing.
    ///
    /// # Errors
    ///
    /// History failures and listener errors raised by the broadcast.
    pub fn apply_batch(&self, writes: &[ParamWrite], mode: HistoryMode) -> Result<bool, UrlSyncError> {
        if writes.is_empty() {
            return Ok(false);
        }
        let history = self.intercepted().ok_or(UrlSyncError::HistoryUnavailable)?;
        let current = history.location();
        let next = apply_writes(&current, writes);
        if next == current {
            tracing::debug!(edits = writes.len(), "navigation skipped; url unchanged");
            return Ok(false);
        }

        let _span = tracing::debug_span!(
            "url_navigation",
            mode = ?mode,
            edits = writes.len(),
            query = next.query().unwrap_or("")
        )
        .entered();
        history.commit(&next, mode)?;
        Ok(true)
    }

    /// Broadcast after a back/forward navigation the host observed itself.
    ///
    /// # Errors
    ///
    /// The first listener error.
    pub fn notify_pop_state(&self) -> Result<(), UrlSyncError> {
        self.inner.broadcast_location(NavigationSource::PopState)
    }

    /// Broadcast a change posted by foreign code sharing the channel.
    ///
    /// Accepts `{"search": "?a=1"}` or `{"href": "https://..."}`. Payloads
    /// of any other shape are logged and dropped (`Ok(false)`).
    ///
    /// # Errors
    ///
    /// The first listener error.
    pub fn dispatch_payload(&self, payload: &Value) -> Result<bool, UrlSyncError> {
        let snapshot = match payload_snapshot(payload) {
            Some(snapshot) => snapshot,
            None => {
                tracing::warn!(%payload, "malformed url change payload dropped");
                return Ok(false);
            }
        };
        self.inner.broadcast(UrlChangeEvent {
            source: NavigationSource::External,
            snapshot: Rc::new(snapshot),
        })?;
        Ok(true)
    }

    fn intercepted(&self) -> Option<Rc<InterceptedHistory>> {
        self.inner.intercepted.borrow().clone()
    }
}

fn payload_snapshot(payload: &Value) -> Option<UrlSnapshot> {
    let object = payload.as_object()?;
    if let Some(search) = object.get("search") {
        return search.as_str().map(UrlSnapshot::from_query);
    }
    let href = object.get("href")?.as_str()?;
    Url::parse(href).ok().map(|url| UrlSnapshot::from_url(&url))
}

impl std::fmt::Debug for UrlChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlChangeBus")
            .field("installed", &self.is_installed())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
