#![forbid(unsafe_code)]

//! Point-in-time views of the query string and edits against it.
//!
//! A [`UrlSnapshot`] groups repeated query entries under one key, keeping
//! first-seen key order and per-key entry order. Snapshots are immutable; the
//! bus builds a fresh one for every navigation.
//!
//! [`ParamWrite`] describes one parameter edit. [`apply_writes`] applies a
//! batch of edits to a URL with `URLSearchParams` semantics: `set` replaces
//! the first occurrence in place and drops the rest, `delete` removes every
//! occurrence, and repeated values are appended after deletion so re-reading
//! reconstructs the written order.

use indexmap::IndexMap;
use url::Url;
use url::form_urlencoded;

/// Value(s) of one query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ParamValue {
    /// Entries in URL order.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::Single(v) => vec![v.as_str()],
            Self::Multiple(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// Number of query entries this value occupies.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multiple(vs) => vs.len(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(first) => {
                let first = std::mem::take(first);
                *self = Self::Multiple(vec![first, value]);
            }
            Self::Multiple(vs) => vs.push(value),
        }
    }
}

/// Parsed query parameters at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlSnapshot {
    params: IndexMap<String, ParamValue>,
}

impl UrlSnapshot {
    /// Snapshot of a full URL's query component.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        Self::from_query(url.query().unwrap_or(""))
    }

    /// Snapshot of a raw query string (with or without the leading `?`).
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params: IndexMap<String, ParamValue> = IndexMap::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match params.get_mut(key.as_ref()) {
                Some(existing) => existing.push(value.into_owned()),
                None => {
                    params.insert(key.into_owned(), ParamValue::Single(value.into_owned()));
                }
            }
        }
        Self { params }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Reconstructed query text for one key, e.g. `tag=js&tag=ts`.
///
/// The write cache compares these strings, so a value is "unchanged" exactly
/// when it would produce the same query entries.
#[must_use]
pub fn query_fragment(key: &str, value: Option<&ParamValue>) -> Option<String> {
    let value = value?;
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for v in value.values() {
        serializer.append_pair(key, v);
    }
    Some(serializer.finish())
}

/// Inverse of [`query_fragment`]: the entry values in order.
#[must_use]
pub fn fragment_values(fragment: &str) -> Vec<String> {
    form_urlencoded::parse(fragment.as_bytes())
        .map(|(_, v)| v.into_owned())
        .collect()
}

/// One parameter edit. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamWrite {
    pub key: String,
    pub value: Option<ParamValue>,
}

impl ParamWrite {
    #[must_use]
    pub fn set(key: impl Into<String>, value: ParamValue) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// Apply `writes` to a copy of `url`'s query, in order.
#[must_use]
pub fn apply_writes(url: &Url, writes: &[ParamWrite]) -> Url {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    for write in writes {
        match &write.value {
            None => pairs.retain(|(k, _)| k != &write.key),
            Some(ParamValue::Single(value)) => set_pair(&mut pairs, &write.key, value),
            Some(ParamValue::Multiple(values)) => {
                pairs.retain(|(k, _)| k != &write.key);
                pairs.extend(values.iter().map(|v| (write.key.clone(), v.clone())));
            }
        }
    }

    let mut next = url.clone();
    if pairs.is_empty() {
        next.set_query(None);
    } else {
        next.query_pairs_mut().clear().extend_pairs(pairs);
    }
    next
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    let mut seen = false;
    pairs.retain_mut(|(k, v)| {
        if k != key {
            return true;
        }
        if seen {
            return false;
        }
        seen = true;
        value.clone_into(v);
        true
    });
    if !seen {
        pairs.push((key.to_owned(), value.to_owned()));
    }
}
