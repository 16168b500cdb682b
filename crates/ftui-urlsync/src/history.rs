#![forbid(unsafe_code)]

//! The host's History capability.
//!
//! [`History`] is the narrow surface the bus needs from a browser
//! `window.history` (or any other navigation host): read the current
//! location, commit a URL with push or replace semantics, and report
//! back/forward navigation. [`MemoryHistory`] is an in-memory implementation
//! for tests and non-browser hosts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::UrlSyncError;

/// Whether a navigation adds or overwrites a history entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    #[default]
    Push,
    Replace,
}

/// Listener invoked after a back/forward navigation.
pub type PopStateListener = Rc<dyn Fn()>;

/// Navigation capability of the host environment.
pub trait History {
    /// Current full URL.
    fn location(&self) -> Url;

    /// Commit `url` as a new history entry.
    fn push_state(&self, url: &Url) -> Result<(), UrlSyncError>;

    /// Overwrite the current history entry with `url`.
    fn replace_state(&self, url: &Url) -> Result<(), UrlSyncError>;

    /// Register a listener for back/forward navigation.
    ///
    /// Hosts without such a signal may ignore the listener and forward
    /// `popstate` through [`UrlChangeBus::notify_pop_state`] instead.
    ///
    /// [`UrlChangeBus::notify_pop_state`]: crate::bus::UrlChangeBus::notify_pop_state
    fn on_pop_state(&self, listener: PopStateListener) {
        let _ = listener;
    }

    /// Commit `url` with the given mode.
    fn commit(&self, url: &Url, mode: HistoryMode) -> Result<(), UrlSyncError> {
        match mode {
            HistoryMode::Push => self.push_state(url),
            HistoryMode::Replace => self.replace_state(url),
        }
    }
}

/// One committed navigation, recorded by [`MemoryHistory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub mode: HistoryMode,
    pub url: Url,
}

/// In-memory history stack with back/forward support.
pub struct MemoryHistory {
    entries: RefCell<Vec<Url>>,
    index: Cell<usize>,
    commits: RefCell<Vec<CommitRecord>>,
    pop_listeners: RefCell<Vec<PopStateListener>>,
}

impl MemoryHistory {
    /// Create a history whose single entry is `initial`.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::InvalidUrl`] when `initial` does not parse.
    pub fn new(initial: &str) -> Result<Self, UrlSyncError> {
        Ok(Self {
            entries: RefCell::new(vec![Url::parse(initial)?]),
            index: Cell::new(0),
            commits: RefCell::new(Vec::new()),
            pop_listeners: RefCell::new(Vec::new()),
        })
    }

    /// Number of entries in the stack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Position of the current entry.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index.get()
    }

    /// Every push/replace committed so far, oldest first.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.borrow().clone()
    }

    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.borrow().len()
    }

    /// Move one entry back. Returns `false` at the start of the stack.
    pub fn back(&self) -> bool {
        self.go(-1)
    }

    /// Move one entry forward. Returns `false` at the end of the stack.
    pub fn forward(&self) -> bool {
        self.go(1)
    }

    /// Move `delta` entries and raise the pop-state signal.
    pub fn go(&self, delta: isize) -> bool {
        let len = self.len();
        let Some(target) = self.index.get().checked_add_signed(delta) else {
            return false;
        };
        if delta == 0 || target >= len {
            return false;
        }
        self.index.set(target);
        let listeners: Vec<PopStateListener> = self.pop_listeners.borrow().clone();
        for listener in listeners {
            listener();
        }
        true
    }
}

impl History for MemoryHistory {
    fn location(&self) -> Url {
        self.entries.borrow()[self.index.get()].clone()
    }

    fn push_state(&self, url: &Url) -> Result<(), UrlSyncError> {
        let mut entries = self.entries.borrow_mut();
        let next = self.index.get() + 1;
        entries.truncate(next);
        entries.push(url.clone());
        self.index.set(next);
        self.commits.borrow_mut().push(CommitRecord {
            mode: HistoryMode::Push,
            url: url.clone(),
        });
        Ok(())
    }

    fn replace_state(&self, url: &Url) -> Result<(), UrlSyncError> {
        self.entries.borrow_mut()[self.index.get()] = url.clone();
        self.commits.borrow_mut().push(CommitRecord {
            mode: HistoryMode::Replace,
            url: url.clone(),
        });
        Ok(())
    }

    fn on_pop_state(&self, listener: PopStateListener) {
        self.pop_listeners.borrow_mut().push(listener);
    }
}

impl std::fmt::Debug for MemoryHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHistory")
            .field("location", &self.location().as_str())
            .field("index", &self.index.get())
            .field("len", &self.len())
            .finish()
    }
}
