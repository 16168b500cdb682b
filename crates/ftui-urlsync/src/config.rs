#![forbid(unsafe_code)]

//! Binding-wide options.
//!
//! [`BindOptions`] carries the settings shared by every field of one
//! binding; field-level [`ParamOptions`](crate::handler::ParamOptions)
//! override them. The declarative subset can be loaded from JSON as a
//! [`SyncPolicy`].

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::debounce::DebounceConfig;
use crate::error::UrlSyncError;
use crate::handler::{CodecFn, DeserializeFn, SerializeFn};
use crate::history::HistoryMode;

/// Key prefix: fixed, or read from reactive state.
#[derive(Clone)]
pub enum Prefix {
    Static(String),
    /// Observed through the reactive host; a change rewrites every key.
    Reactive(Rc<dyn Fn() -> String>),
}

impl Prefix {
    #[must_use]
    pub fn reactive(getter: impl Fn() -> String + 'static) -> Self {
        Self::Reactive(Rc::new(getter))
    }

    /// Current prefix text.
    #[must_use]
    pub fn current(&self) -> String {
        match self {
            Self::Static(prefix) => prefix.clone(),
            Self::Reactive(getter) => getter(),
        }
    }
}

impl Default for Prefix {
    fn default() -> Self {
        Self::Static(String::new())
    }
}

impl From<&str> for Prefix {
    fn from(prefix: &str) -> Self {
        Self::Static(prefix.to_owned())
    }
}

impl From<String> for Prefix {
    fn from(prefix: String) -> Self {
        Self::Static(prefix)
    }
}

impl std::fmt::Debug for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(prefix) => f.debug_tuple("Static").field(prefix).finish(),
            Self::Reactive(_) => f.write_str("Reactive(..)"),
        }
    }
}

/// Receives the binding's disposer in place of the reactive host's
/// teardown scope.
pub type TeardownRegistrar = Rc<dyn Fn(Box<dyn FnOnce()>)>;

/// Options shared by every field of one binding.
#[derive(Clone, Default)]
pub struct BindOptions {
    pub prefix: Prefix,
    pub history: Option<HistoryMode>,
    /// Binding-wide debounce for fields with the inherit policy.
    pub debounce: Option<DebounceConfig>,
    pub encode: Option<CodecFn>,
    pub decode: Option<CodecFn>,
    pub serialize: Option<SerializeFn>,
    pub deserialize: Option<DeserializeFn>,
    pub on_destroy: Option<TeardownRegistrar>,
}

impl BindOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying the declarative settings of `policy`.
    #[must_use]
    pub fn from_policy(policy: &SyncPolicy) -> Self {
        Self {
            prefix: Prefix::Static(policy.prefix.clone()),
            history: Some(policy.history),
            debounce: policy.debounce,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<Prefix>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_history(mut self, mode: HistoryMode) -> Self {
        self.history = Some(mode);
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, config: DebounceConfig) -> Self {
        self.debounce = Some(config);
        self
    }

    #[must_use]
    pub fn with_encode(mut self, f: impl Fn(&str) -> String + 'static) -> Self {
        self.encode = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn with_decode(mut self, f: impl Fn(&str) -> String + 'static) -> Self {
        self.decode = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn with_serialize(mut self, f: impl Fn(&Value) -> Option<String> + 'static) -> Self {
        self.serialize = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn with_deserialize(mut self, f: impl Fn(&str) -> Option<Value> + 'static) -> Self {
        self.deserialize = Some(Rc::new(f));
        self
    }

    /// Hand the binding's disposer to `f` instead of the host teardown scope.
    #[must_use]
    pub fn with_on_destroy(mut self, f: impl Fn(Box<dyn FnOnce()>) + 'static) -> Self {
        self.on_destroy = Some(Rc::new(f));
        self
    }

    /// # Errors
    ///
    /// [`UrlSyncError::InvalidDebounce`] for a malformed binding-wide debounce.
    pub fn validate(&self) -> Result<(), UrlSyncError> {
        match &self.debounce {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindOptions")
            .field("prefix", &self.prefix)
            .field("history", &self.history)
            .field("debounce", &self.debounce)
            .field("custom_codecs", &self.encode.is_some())
            .field("on_destroy", &self.on_destroy.is_some())
            .finish_non_exhaustive()
    }
}

/// Declarative binding settings, loadable from JSON.
///
/// ```
/// use ftui_urlsync::config::SyncPolicy;
/// use ftui_urlsync::history::HistoryMode;
///
/// let policy = SyncPolicy::from_json(
///     r#"{"prefix": "grid_", "history": "replace", "debounce": {"idle_ms": 50, "max_wait_ms": 400}}"#,
/// ).unwrap();
/// assert_eq!(policy.history, HistoryMode::Replace);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncPolicy {
    pub prefix: String,
    pub history: HistoryMode,
    pub debounce: Option<DebounceConfig>,
}

impl SyncPolicy {
    /// Parse and validate a JSON policy.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::Policy`] for malformed JSON and
    /// [`UrlSyncError::InvalidDebounce`] for inconsistent bounds.
    pub fn from_json(text: &str) -> Result<Self, UrlSyncError> {
        let policy: Self =
            serde_json::from_str(text).map_err(|err| UrlSyncError::Policy(err.to_string()))?;
        if let Some(debounce) = &policy.debounce {
            debounce.validate()?;
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_when_fields_missing() {
        let policy = SyncPolicy::from_json("{}").unwrap();
        assert_eq!(policy, SyncPolicy::default());
        assert_eq!(policy.history, HistoryMode::Push);
    }

    #[test]
    fn policy_rejects_bad_debounce() {
        let err = SyncPolicy::from_json(r#"{"debounce": {"idle_ms": 500, "max_wait_ms": 100}}"#)
            .unwrap_err();
        assert!(matches!(err, UrlSyncError::InvalidDebounce { .. }));
    }

    #[test]
    fn policy_rejects_unknown_fields() {
        let err = SyncPolicy::from_json(r#"{"prefx": "a"}"#).unwrap_err();
        assert!(matches!(err, UrlSyncError::Policy(_)));
    }

    #[test]
    fn options_from_policy() {
        let policy = SyncPolicy {
            prefix: "a_".into(),
            history: HistoryMode::Replace,
            debounce: DebounceConfig::new(5, 10).ok(),
        };
        let options = BindOptions::from_policy(&policy);
        assert_eq!(options.prefix.current(), "a_");
        assert_eq!(options.history, Some(HistoryMode::Replace));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn reactive_prefix_reads_getter() {
        let cell = Rc::new(std::cell::RefCell::new(String::from("x_")));
        let c = Rc::clone(&cell);
        let prefix = Prefix::reactive(move || c.borrow().clone());
        assert_eq!(prefix.current(), "x_");
        *cell.borrow_mut() = "y_".into();
        assert_eq!(prefix.current(), "y_");
    }
}
