#![forbid(unsafe_code)]

//! Key ownership and the write cache.
//!
//! The registry maps each escaped query key to the one live handler that
//! owns it, and each key to the query text last written or read for it.
//! The cache is used for equality only: a write whose reconstructed query
//! text matches the cache is dropped, and a navigation whose text matches is
//! recognised as the echo of our own write.
//!
//! # Invariants
//!
//! 1. At most one live handler owns a key.
//! 2. Releasing a key clears its cache entry and any pending debounce.
//! 3. Field values are never derived from the cache.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::debounce::DebounceScheduler;
use crate::error::UrlSyncError;
use crate::handler::ResolvedHandler;

/// Shared key registry and write cache.
pub struct KeyRegistry {
    handlers: RefCell<AHashMap<String, Rc<ResolvedHandler>>>,
    cache: RefCell<AHashMap<String, String>>,
    scheduler: Rc<DebounceScheduler>,
}

impl KeyRegistry {
    #[must_use]
    pub fn new(scheduler: Rc<DebounceScheduler>) -> Self {
        Self {
            handlers: RefCell::new(AHashMap::new()),
            cache: RefCell::new(AHashMap::new()),
            scheduler,
        }
    }

    /// Claim `handler.key` for `handler`. Re-registering the same handler is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::KeyConflict`] when another handler owns the key.
    pub fn register(&self, handler: &Rc<ResolvedHandler>) -> Result<(), UrlSyncError> {
        let mut handlers = self.handlers.borrow_mut();
        if let Some(owner) = handlers.get(&handler.key) {
            if Rc::ptr_eq(owner, handler) {
                return Ok(());
            }
            return Err(UrlSyncError::KeyConflict {
                key: handler.key.clone(),
            });
        }
        handlers.insert(handler.key.clone(), Rc::clone(handler));
        Ok(())
    }

    /// Register every handler or none of them.
    ///
    /// # Errors
    ///
    /// The first [`UrlSyncError::KeyConflict`]; handlers registered earlier
    /// in the same call are released again.
    pub fn register_all(&self, handlers: &[Rc<ResolvedHandler>]) -> Result<(), UrlSyncError> {
        for (i, handler) in handlers.iter().enumerate() {
            if let Err(err) = self.register(handler) {
                for done in &handlers[..i] {
                    self.unregister(&done.key);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release `key`, its cache entry and its pending debounce.
    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.handlers.borrow_mut().remove(key).is_some();
        self.cache.borrow_mut().remove(key);
        self.scheduler.clear(key);
        removed
    }

    #[must_use]
    pub fn owner(&self, key: &str) -> Option<Rc<ResolvedHandler>> {
        self.handlers.borrow().get(key).cloned()
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.handlers.borrow().contains_key(key)
    }

    /// Whether `handler` is the live owner of `key`.
    #[must_use]
    pub fn is_owned_by(&self, key: &str, handler: &Rc<ResolvedHandler>) -> bool {
        self.handlers
            .borrow()
            .get(key)
            .is_some_and(|owner| Rc::ptr_eq(owner, handler))
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.borrow().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn read_cached(&self, key: &str) -> Option<String> {
        self.cache.borrow().get(key).cloned()
    }

    pub fn write_cached(&self, key: &str, fragment: String) {
        self.cache.borrow_mut().insert(key.to_owned(), fragment);
    }

    pub fn drop_cached(&self, key: &str) {
        self.cache.borrow_mut().remove(key);
    }

    /// Store `fragment`, or drop the entry when `None`.
    pub fn set_cached(&self, key: &str, fragment: Option<String>) {
        match fragment {
            Some(fragment) => self.write_cached(key, fragment),
            None => self.drop_cached(key),
        }
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("keys", &self.keys())
            .field("cached", &self.cache.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindOptions;
    use crate::debounce::{DebounceConfig, ManualClock};
    use crate::handler::{ParamConfig, ParamOptions, resolve_handler};

    fn registry() -> (Rc<DebounceScheduler>, KeyRegistry) {
        let scheduler = Rc::new(DebounceScheduler::new(Rc::new(ManualClock::new())));
        (Rc::clone(&scheduler), KeyRegistry::new(scheduler))
    }

    fn handler(field: &str, config: ParamConfig) -> Rc<ResolvedHandler> {
        Rc::new(resolve_handler(field, &config, &BindOptions::default(), ""))
    }

    #[test]
    fn second_owner_for_key_conflicts() {
        let (_s, reg) = registry();
        let a = handler("id", ParamConfig::default());
        let b = handler("id", ParamConfig::default());
        reg.register(&a).unwrap();
        reg.register(&a).unwrap();
        assert_eq!(
            reg.register(&b),
            Err(UrlSyncError::KeyConflict { key: "id".into() })
        );
        assert!(reg.is_owned_by("id", &a));
        assert!(!reg.is_owned_by("id", &b));
    }

    #[test]
    fn explicit_keys_can_collide_across_fields() {
        let (_s, reg) = registry();
        let a = handler("user", ParamOptions::new().key("id").into());
        let b = handler("id", ParamConfig::default());
        let err = reg.register_all(&[a, b]).unwrap_err();
        assert!(matches!(err, UrlSyncError::KeyConflict { .. }));
        assert!(reg.keys().is_empty(), "failed batch must not leave keys behind");
    }

    #[test]
    fn unregister_releases_cache_and_debounce() {
        let (sched, reg) = registry();
        let a = handler("q", ParamConfig::default());
        reg.register(&a).unwrap();
        reg.write_cached("q", "q=1".into());
        sched.enqueue("q", || {}, DebounceConfig::new(10, 10).unwrap());

        assert!(reg.unregister("q"));
        assert_eq!(reg.read_cached("q"), None);
        assert!(!sched.is_pending("q"));
        assert!(!reg.is_registered("q"));

        let b = handler("q", ParamConfig::default());
        reg.register(&b).unwrap();
    }

    #[test]
    fn set_cached_none_drops_entry() {
        let (_s, reg) = registry();
        reg.set_cached("k", Some("k=1".into()));
        assert_eq!(reg.read_cached("k").as_deref(), Some("k=1"));
        reg.set_cached("k", None);
        assert_eq!(reg.read_cached("k"), None);
    }
}
