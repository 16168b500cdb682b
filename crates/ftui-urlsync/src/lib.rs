#![forbid(unsafe_code)]

//! Bidirectional bindings between reactive state and the URL query string.
//!
//! This crate provides:
//! - [`UrlSync`], the per-page coordinator, and [`UrlSync::bind`] to bind
//!   fields of a [`BindTarget`] to query parameters
//! - [`UrlChangeBus`] to fan out every navigation (ours, external, back/forward)
//! - [`DebounceScheduler`] with idle and max-wait bounds, driven by the host
//!   through [`UrlSync::poll_timers`] and [`UrlSync::handle_lifecycle`]
//! - [`MemoryHistory`], [`Runtime`] and [`Store`] as in-process stand-ins for
//!   the browser history and a reactive store
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use ftui_urlsync::{BindOptions, BindTarget, History, ManualClock, MemoryHistory, ParamConfig, Runtime, Store, UrlSync};
//! use serde_json::json;
//!
//! let history = Rc::new(MemoryHistory::new("https://app.test/list?page=3").unwrap());
//! let sync = UrlSync::new(Some(history.clone()), Rc::new(ManualClock::new()));
//! let rt = Runtime::new();
//! let store = Rc::new(Store::new(&rt).with_field("page", json!(1)));
//!
//! sync.bind(store.clone(), Rc::new(rt.clone()), [("page", ParamConfig::default())], BindOptions::new())
//!     .unwrap();
//! assert_eq!(store.peek("page"), Some(json!(3)));
//!
//! store.set("page", json!(4));
//! rt.run_until_idle();
//! assert_eq!(history.location().query(), Some("page=4"));
//! ```

pub mod binding;
pub mod bus;
pub mod config;
pub mod debounce;
pub mod error;
pub mod handler;
pub mod history;
pub mod reactive;
pub mod registry;
pub mod snapshot;

pub use binding::{BindingHandle, UrlSync};
pub use bus::{NavigationSource, UrlChangeBus, UrlChangeEvent};
pub use config::{BindOptions, Prefix, SyncPolicy};
pub use debounce::{Clock, DebounceConfig, DebounceScheduler, ManualClock, PageLifecycle, SystemClock};
pub use error::UrlSyncError;
pub use handler::{DebouncePolicy, Entries, LegacyKey, ParamConfig, ParamOptions};
pub use history::{History, HistoryMode, MemoryHistory};
pub use reactive::{BindTarget, Disposer, ReactiveHost, Runtime, Store};
pub use snapshot::{ParamValue, UrlSnapshot};
