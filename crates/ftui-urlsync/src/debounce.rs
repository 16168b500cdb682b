#![forbid(unsafe_code)]

//! Per-key debounce scheduling with idle and max-wait bounds.
//!
//! The scheduler is host-driven: it never spawns timers itself. Each pending
//! key carries two deadlines computed from a [`Clock`], and the host calls
//! [`DebounceScheduler::poll`] once [`DebounceScheduler::next_deadline`] has
//! elapsed (a `setTimeout` in a browser, a tick in a native loop).
//!
//! # Invariants
//!
//! 1. A key has at most one pending entry; enqueuing replaces the callback.
//! 2. The idle deadline moves on every enqueue; the max-wait deadline is
//!    fixed by the first enqueue of a burst and never postponed.
//! 3. A callback runs at most once; whichever deadline passes first wins and
//!    the entry is removed before the callback executes.
//! 4. `max_wait_ms >= idle_ms` for every accepted [`DebounceConfig`].
//! 5. Negative bounds mean "due at the next poll".
//!
//! # Failure Modes
//!
//! - `clear()` on a key with nothing pending returns `false`.
//! - A callback that enqueues again (even for its own key) starts a new burst.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::error::UrlSyncError;

/// Idle / max-wait bounds for one debounced parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    idle_ms: i64,
    max_wait_ms: i64,
}

impl DebounceConfig {
    /// Create a validated config.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::InvalidDebounce`] when `max_wait_ms < idle_ms`.
    pub fn new(idle_ms: i64, max_wait_ms: i64) -> Result<Self, UrlSyncError> {
        let config = Self {
            idle_ms,
            max_wait_ms,
        };
        config.validate()?;
        Ok(config)
    }

    /// Degenerate config that flushes at the next poll.
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            idle_ms: -1,
            max_wait_ms: -1,
        }
    }

    /// Re-check the bounds. Configs loaded through serde skip [`Self::new`].
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::InvalidDebounce`] when `max_wait_ms < idle_ms`.
    pub fn validate(&self) -> Result<(), UrlSyncError> {
        if self.max_wait_ms < self.idle_ms {
            return Err(UrlSyncError::InvalidDebounce {
                idle_ms: self.idle_ms,
                max_wait_ms: self.max_wait_ms,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn idle_ms(&self) -> i64 {
        self.idle_ms
    }

    #[must_use]
    pub const fn max_wait_ms(&self) -> i64 {
        self.max_wait_ms
    }

    fn idle(&self) -> Duration {
        clamp_ms(self.idle_ms)
    }

    fn max_wait(&self) -> Duration {
        clamp_ms(self.max_wait_ms)
    }
}

fn clamp_ms(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of monotonic time for deadline computation.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `web_time::Instant` (works on wasm32).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Cell<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Time elapsed since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset.get()
    }
}

// ---------------------------------------------------------------------------
// Page lifecycle
// ---------------------------------------------------------------------------

/// Page lifecycle transitions reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageLifecycle {
    /// Page became visible again.
    Visible,
    /// `visibilitychange` to hidden.
    Hidden,
    /// `pagehide` (bfcache entry or navigation away).
    PageHide,
    /// `beforeunload` / `unload`.
    Unload,
}

impl PageLifecycle {
    /// Whether pending writes must be flushed before the handler returns.
    #[must_use]
    pub const fn requires_flush(self) -> bool {
        !matches!(self, Self::Visible)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

type Callback = Box<dyn FnOnce()>;

struct DebounceEntry {
    idle_deadline: Instant,
    max_deadline: Instant,
    callback: Callback,
}

impl DebounceEntry {
    fn due_at(&self) -> Instant {
        self.idle_deadline.min(self.max_deadline)
    }
}

/// Coalesces rapid per-key callbacks into one invocation.
pub struct DebounceScheduler {
    clock: Rc<dyn Clock>,
    pending: RefCell<AHashMap<String, DebounceEntry>>,
}

impl DebounceScheduler {
    #[must_use]
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: RefCell::new(AHashMap::new()),
        }
    }

    /// Schedule `callback` for `key`, replacing whatever was pending.
    pub fn enqueue(&self, key: &str, callback: impl FnOnce() + 'static, config: DebounceConfig) {
        let now = self.clock.now();
        let idle_deadline = now + config.idle();
        let mut pending = self.pending.borrow_mut();
        let max_deadline = match pending.get(key) {
            Some(entry) => entry.max_deadline,
            None => now + config.max_wait(),
        };
        tracing::trace!(key, idle_ms = config.idle_ms, "debounce enqueue");
        pending.insert(
            key.to_owned(),
            DebounceEntry {
                idle_deadline,
                max_deadline,
                callback: Box::new(callback),
            },
        );
    }

    /// Drop the pending entry for `key` without running it.
    pub fn clear(&self, key: &str) -> bool {
        self.pending.borrow_mut().remove(key).is_some()
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.borrow().contains_key(key)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Earliest instant at which [`Self::poll`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.borrow().values().map(DebounceEntry::due_at).min()
    }

    /// Run every callback whose idle or max-wait deadline has passed.
    ///
    /// Returns the number of callbacks invoked.
    pub fn poll(&self) -> usize {
        let now = self.clock.now();
        self.take_and_run(|entry| entry.due_at() <= now)
    }

    /// Run every pending callback immediately.
    pub fn flush_all(&self) -> usize {
        self.take_and_run(|_| true)
    }

    /// Flush synchronously when the page is going away.
    pub fn handle_lifecycle(&self, event: PageLifecycle) -> usize {
        if !event.requires_flush() {
            return 0;
        }
        let flushed = self.flush_all();
        tracing::debug!(?event, flushed, "debounce lifecycle flush");
        flushed
    }

    fn take_and_run(&self, due: impl Fn(&DebounceEntry) -> bool) -> usize {
        // Entries leave the map before any callback runs so callbacks may
        // enqueue or clear freely.
        let mut ready: Vec<(String, DebounceEntry)> = {
            let mut pending = self.pending.borrow_mut();
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| due(entry))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|entry| (key, entry)))
                .collect()
        };
        ready.sort_by(|a, b| a.1.due_at().cmp(&b.1.due_at()).then_with(|| a.0.cmp(&b.0)));

        let count = ready.len();
        for (key, entry) in ready {
            tracing::trace!(key = %key, "debounce fire");
            (entry.callback)();
        }
        count
    }
}

impl std::fmt::Debug for DebounceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceScheduler")
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}
