#![allow(dead_code)]

//! Shared harness: in-memory history, manual clock and a reactive store.

use std::cell::Cell;
use std::rc::Rc;

use ftui_urlsync::{
    BindOptions, BindingHandle, History, ManualClock, MemoryHistory, ParamConfig, Runtime, Store,
    UrlSync, UrlSyncError,
};
use serde_json::Value;
use url::Url;

pub struct Harness {
    pub history: Rc<MemoryHistory>,
    pub clock: Rc<ManualClock>,
    pub sync: UrlSync,
    pub rt: Runtime,
}

impl Harness {
    pub fn new(url: &str) -> Self {
        let history = Rc::new(MemoryHistory::new(url).unwrap());
        let clock = Rc::new(ManualClock::new());
        let sync = UrlSync::new(Some(history.clone()), clock.clone());
        Self {
            history,
            clock,
            sync,
            rt: Runtime::new(),
        }
    }

    pub fn store(&self, fields: &[(&str, Value)]) -> Rc<Store> {
        let store = fields
            .iter()
            .fold(Store::new(&self.rt), |s, (name, value)| s.with_field(*name, value.clone()));
        Rc::new(store)
    }

    pub fn bind(
        &self,
        store: &Rc<Store>,
        fields: Vec<(&str, ParamConfig)>,
        options: BindOptions,
    ) -> Result<BindingHandle, UrlSyncError> {
        self.sync
            .bind(store.clone(), Rc::new(self.rt.clone()), fields, options)
    }

    pub fn settle(&self) {
        self.rt.run_until_idle();
    }

    pub fn query(&self) -> String {
        self.history.location().query().unwrap_or("").to_owned()
    }

    /// Navigate through the intercepted history, as foreign code would.
    pub fn navigate(&self, url: &str) {
        let history = self.sync.history().unwrap();
        history.push_state(&Url::parse(url).unwrap()).unwrap();
    }

    pub fn advance(&self, ms: u64) -> usize {
        self.clock.advance_ms(ms);
        self.sync.poll_timers()
    }
}

/// Resolve function that counts its invocations.
pub fn counting_resolve(
    map: impl Fn(Option<Value>) -> Value + 'static,
) -> (
    Rc<Cell<usize>>,
    impl Fn(Option<Value>, &str, Option<usize>) -> Value + 'static,
) {
    let calls = Rc::new(Cell::new(0));
    let c = Rc::clone(&calls);
    let resolve = move |raw: Option<Value>, _: &str, _: Option<usize>| {
        c.set(c.get() + 1);
        map(raw)
    };
    (calls, resolve)
}

pub fn identity(raw: Option<Value>) -> Value {
    raw.unwrap_or(Value::Null)
}
