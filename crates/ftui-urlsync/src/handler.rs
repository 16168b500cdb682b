#![forbid(unsafe_code)]

//! Per-field parameter configuration and its resolution into handlers.
//!
//! A field is configured either with a bare resolve function or with
//! [`ParamOptions`]. [`resolve_handler`] folds the field config, the binding
//! options and the active prefix into a [`ResolvedHandler`] with every
//! default applied:
//!
//! | Setting | Default |
//! |---------|---------|
//! | key | field name |
//! | resolve | identity (absent becomes `null`) |
//! | serialize | JSON text; `null` removes the key |
//! | deserialize | JSON parse, raw string fallback, `"undefined"` is absent |
//! | encode / decode | URI component escaping |
//! | entries | [`Entries::Single`] |
//! | history | [`HistoryMode::Push`] |
//! | debounce | [`DebouncePolicy::Inherit`] |
//!
//! The default deserializer maps the literal `"undefined"` to the absent
//! value although the default serializer never produces it, so a custom
//! value that serializes to `undefined` reads back as absent.

use std::rc::Rc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BindOptions;
use crate::debounce::DebounceConfig;
use crate::error::UrlSyncError;
use crate::history::HistoryMode;
use crate::snapshot::ParamValue;

/// Maps the deserialized intermediate into the field value.
///
/// Arguments: raw intermediate (`None` when absent), parameter name, and the
/// entry index for multi-entry parameters.
pub type ResolveFn = Rc<dyn Fn(Option<Value>, &str, Option<usize>) -> Value>;
/// Field value to text. `None` removes the parameter.
pub type SerializeFn = Rc<dyn Fn(&Value) -> Option<String>>;
/// Text to raw intermediate. `None` is the absent value.
pub type DeserializeFn = Rc<dyn Fn(&str) -> Option<Value>>;
/// String-to-string transform used for encode / decode.
pub type CodecFn = Rc<dyn Fn(&str) -> String>;

/// Characters left unescaped by `encodeURIComponent`.
const URI_COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Standard URI component escaping.
#[must_use]
pub fn default_encode(raw: &str) -> String {
    utf8_percent_encode(raw, URI_COMPONENT_SET).to_string()
}

#[must_use]
pub fn default_decode(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

#[must_use]
pub fn default_serialize(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    serde_json::to_string(value).ok()
}

#[must_use]
pub fn default_deserialize(text: &str) -> Option<Value> {
    if text == "undefined" {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned())))
}

fn identity_resolve() -> ResolveFn {
    Rc::new(|raw: Option<Value>, _: &str, _: Option<usize>| raw.unwrap_or(Value::Null))
}

/// Escape a parameter name for use as a query key.
#[must_use]
pub fn escape_key(name: &str) -> String {
    default_encode(name)
}

/// Whether a parameter holds one value or a list of repeated entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entries {
    #[default]
    Single,
    Multiple,
}

/// Per-field debounce choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebouncePolicy {
    /// Always write immediately.
    Disabled,
    /// Use the binding-wide debounce, if any.
    #[default]
    Inherit,
    Custom(DebounceConfig),
}

/// A previous parameter name being migrated away from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyKey {
    pub name: String,
    /// Delete the legacy key from the URL after setup.
    pub remove: bool,
    /// Hydrate the field from the legacy key when present.
    pub apply_on_hydrate: bool,
    pub removal_history: HistoryMode,
}

impl LegacyKey {
    /// Hydrate from `name`, then remove it with a replace navigation.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remove: true,
            apply_on_hydrate: true,
            removal_history: HistoryMode::Replace,
        }
    }

    /// Leave the legacy key in the URL.
    #[must_use]
    pub fn keep(mut self) -> Self {
        self.remove = false;
        self
    }

    /// Do not read the legacy value into the field.
    #[must_use]
    pub fn without_hydrate(mut self) -> Self {
        self.apply_on_hydrate = false;
        self
    }

    #[must_use]
    pub fn removal_history(mut self, mode: HistoryMode) -> Self {
        self.removal_history = mode;
        self
    }

    /// Escaped query key for this legacy name.
    #[must_use]
    pub fn key(&self) -> String {
        escape_key(&self.name)
    }
}

/// Verbose per-field configuration. Unset fields fall back to the binding
/// options, then to the crate defaults.
#[derive(Clone, Default)]
pub struct ParamOptions {
    key: Option<String>,
    resolve: Option<ResolveFn>,
    serialize: Option<SerializeFn>,
    deserialize: Option<DeserializeFn>,
    encode: Option<CodecFn>,
    decode: Option<CodecFn>,
    entries: Entries,
    history: Option<HistoryMode>,
    debounce: DebouncePolicy,
    legacy_keys: Vec<LegacyKey>,
}

impl ParamOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameter name to use instead of the field name.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn resolve(mut self, f: impl Fn(Option<Value>, &str, Option<usize>) -> Value + 'static) -> Self {
        self.resolve = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn serialize(mut self, f: impl Fn(&Value) -> Option<String> + 'static) -> Self {
        self.serialize = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn deserialize(mut self, f: impl Fn(&str) -> Option<Value> + 'static) -> Self {
        self.deserialize = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn encode(mut self, f: impl Fn(&str) -> String + 'static) -> Self {
        self.encode = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn decode(mut self, f: impl Fn(&str) -> String + 'static) -> Self {
        self.decode = Some(Rc::new(f));
        self
    }

    #[must_use]
    pub fn entries(mut self, entries: Entries) -> Self {
        self.entries = entries;
        self
    }

    /// Shorthand for `entries(Entries::Multiple)`.
    #[must_use]
    pub fn multiple(self) -> Self {
        self.entries(Entries::Multiple)
    }

    #[must_use]
    pub fn history(mut self, mode: HistoryMode) -> Self {
        self.history = Some(mode);
        self
    }

    #[must_use]
    pub fn debounce(mut self, policy: DebouncePolicy) -> Self {
        self.debounce = policy;
        self
    }

    #[must_use]
    pub fn legacy_key(mut self, legacy: LegacyKey) -> Self {
        self.legacy_keys.push(legacy);
        self
    }
}

impl std::fmt::Debug for ParamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamOptions")
            .field("key", &self.key)
            .field("entries", &self.entries)
            .field("history", &self.history)
            .field("debounce", &self.debounce)
            .field("legacy_keys", &self.legacy_keys)
            .finish_non_exhaustive()
    }
}

/// Field configuration: a bare resolve function or verbose options.
#[derive(Clone)]
pub enum ParamConfig {
    Resolve(ResolveFn),
    Options(ParamOptions),
}

impl ParamConfig {
    /// Bare resolve function with every other setting defaulted.
    #[must_use]
    pub fn resolve(f: impl Fn(Option<Value>, &str, Option<usize>) -> Value + 'static) -> Self {
        Self::Resolve(Rc::new(f))
    }

    /// Check field-level settings that can only be validated as a whole.
    ///
    /// # Errors
    ///
    /// [`UrlSyncError::InvalidDebounce`] for a malformed custom debounce.
    pub fn validate(&self) -> Result<(), UrlSyncError> {
        match self {
            Self::Options(ParamOptions {
                debounce: DebouncePolicy::Custom(config),
                ..
            }) => config.validate(),
            _ => Ok(()),
        }
    }
}

impl Default for ParamConfig {
    fn default() -> Self {
        Self::Options(ParamOptions::default())
    }
}

impl From<ParamOptions> for ParamConfig {
    fn from(options: ParamOptions) -> Self {
        Self::Options(options)
    }
}

impl std::fmt::Debug for ParamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve(_) => f.write_str("ParamConfig::Resolve(..)"),
            Self::Options(options) => f.debug_tuple("ParamConfig::Options").field(options).finish(),
        }
    }
}

/// Fully-resolved handler for one bound field.
pub struct ResolvedHandler {
    /// Field on the bound target.
    pub field: String,
    /// Escaped query key, prefix included.
    pub key: String,
    pub resolve: ResolveFn,
    pub serialize: SerializeFn,
    pub deserialize: DeserializeFn,
    pub encode: CodecFn,
    pub decode: CodecFn,
    pub entries: Entries,
    pub history: HistoryMode,
    pub debounce: DebouncePolicy,
    pub legacy_keys: Vec<LegacyKey>,
}

impl ResolvedHandler {
    /// Debounce to apply, given the binding-wide setting.
    #[must_use]
    pub fn effective_debounce(&self, global: Option<DebounceConfig>) -> Option<DebounceConfig> {
        match self.debounce {
            DebouncePolicy::Disabled => None,
            DebouncePolicy::Inherit => global,
            DebouncePolicy::Custom(config) => Some(config),
        }
    }

    /// On-the-wire form of a field value: `encode(serialize(value))`.
    ///
    /// For [`Entries::Multiple`] each array element becomes one entry;
    /// elements that serialize to nothing are skipped. An empty result
    /// removes the parameter.
    #[must_use]
    pub fn to_wire(&self, value: &Value) -> Option<ParamValue> {
        match self.entries {
            Entries::Single => (self.serialize)(value).map(|text| ParamValue::Single((self.encode)(&text))),
            Entries::Multiple => {
                debug_assert!(
                    matches!(value, Value::Array(_) | Value::Null),
                    "field '{}' is multiple but not an array",
                    self.field
                );
                let items: &[Value] = match value {
                    Value::Array(items) => items,
                    Value::Null => &[],
                    other => std::slice::from_ref(other),
                };
                let values: Vec<String> = items
                    .iter()
                    .filter_map(|item| (self.serialize)(item))
                    .map(|text| (self.encode)(&text))
                    .collect();
                (!values.is_empty()).then_some(ParamValue::Multiple(values))
            }
        }
    }

    /// Field value for one wire entry: `resolve(deserialize(decode(raw)))`.
    #[must_use]
    pub fn read_value(&self, raw: &str, index: Option<usize>) -> Value {
        let decoded = (self.decode)(raw);
        (self.resolve)((self.deserialize)(&decoded), &self.field, index)
    }
}

impl std::fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("field", &self.field)
            .field("key", &self.key)
            .field("entries", &self.entries)
            .field("history", &self.history)
            .field("debounce", &self.debounce)
            .field("legacy_keys", &self.legacy_keys)
            .finish_non_exhaustive()
    }
}

/// Resolve `config` for `field` under the binding `options` and `prefix`.
#[must_use]
pub fn resolve_handler(
    field: &str,
    config: &ParamConfig,
    options: &BindOptions,
    prefix: &str,
) -> ResolvedHandler {
    let param = match config {
        ParamConfig::Resolve(resolve) => ParamOptions {
            resolve: Some(Rc::clone(resolve)),
            ..ParamOptions::default()
        },
        ParamConfig::Options(param) => param.clone(),
    };
    let name = param.key.as_deref().unwrap_or(field);

    ResolvedHandler {
        field: field.to_owned(),
        key: escape_key(&format!("{prefix}{name}")),
        resolve: param.resolve.unwrap_or_else(identity_resolve),
        serialize: param
            .serialize
            .or_else(|| options.serialize.clone())
            .unwrap_or_else(|| Rc::new(default_serialize)),
        deserialize: param
            .deserialize
            .or_else(|| options.deserialize.clone())
            .unwrap_or_else(|| Rc::new(default_deserialize)),
        encode: param
            .encode
            .or_else(|| options.encode.clone())
            .unwrap_or_else(|| Rc::new(default_encode)),
        decode: param
            .decode
            .or_else(|| options.decode.clone())
            .unwrap_or_else(|| Rc::new(default_decode)),
        entries: param.entries,
        history: param.history.or(options.history).unwrap_or_default(),
        debounce: param.debounce,
        legacy_keys: param.legacy_keys,
    }
}
