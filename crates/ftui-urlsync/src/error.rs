#![forbid(unsafe_code)]

//! Error taxonomy for query-string bindings.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Key conflict | Two live handlers resolve to the same escaped key | `bind` / `set_prefix` fails |
//! | Invalid debounce | `max_wait_ms < idle_ms` | Construction or `bind` fails |
//! | Entries mismatch | Repeated entries for a `single` key | Hydration or navigation call fails |
//! | No history | Host lacks a History capability | Logged; binding is inert |
//! | Malformed payload | Foreign bus payload of the wrong shape | Logged; notification dropped |

/// Errors from binding setup and navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSyncError {
    /// The escaped key is already owned by another live handler.
    KeyConflict { key: String },
    /// Debounce bounds are inconsistent (`max_wait_ms < idle_ms`).
    InvalidDebounce { idle_ms: i64, max_wait_ms: i64 },
    /// The URL carries repeated entries for a key configured as `single`.
    EntriesMismatch { key: String, count: usize },
    /// The host environment has no History capability.
    HistoryUnavailable,
    /// A URL could not be parsed.
    InvalidUrl(String),
    /// The history capability rejected a navigation.
    Navigation(String),
    /// A declarative sync policy could not be parsed.
    Policy(String),
}

impl std::fmt::Display for UrlSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyConflict { key } => {
                write!(f, "query key '{key}' is already bound by another handler")
            }
            Self::InvalidDebounce {
                idle_ms,
                max_wait_ms,
            } => write!(
                f,
                "invalid debounce bounds: max_wait_ms ({max_wait_ms}) < idle_ms ({idle_ms})"
            ),
            Self::EntriesMismatch { key, count } => write!(
                f,
                "query key '{key}' is bound as a single value but the URL has {count} entries"
            ),
            Self::HistoryUnavailable => write!(f, "history capability is unavailable"),
            Self::InvalidUrl(msg) => write!(f, "invalid url: {msg}"),
            Self::Navigation(msg) => write!(f, "navigation failed: {msg}"),
            Self::Policy(msg) => write!(f, "invalid sync policy: {msg}"),
        }
    }
}

impl std::error::Error for UrlSyncError {}

impl From<url::ParseError> for UrlSyncError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}
