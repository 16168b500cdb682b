#![forbid(unsafe_code)]

//! Key ownership, inert degradation and disposal.

mod common;

use std::rc::Rc;

use common::Harness;
use ftui_urlsync::{
    BindOptions, BindTarget, DebounceConfig, ManualClock, ParamConfig, ParamOptions, Runtime,
    Store, UrlSync, UrlSyncError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[test]
fn two_bindings_on_one_key_conflict() {
    let h = Harness::new("https://app.test/?id=7");
    let first = h.store(&[("id", json!(0))]);
    let second = h.store(&[("id", json!(0))]);

    let handle = h
        .bind(&first, vec![("id", ParamConfig::default())], BindOptions::new())
        .unwrap();
    let err = h
        .bind(&second, vec![("id", ParamConfig::default())], BindOptions::new())
        .unwrap_err();
    assert_eq!(err, UrlSyncError::KeyConflict { key: "id".into() });
    assert_eq!(second.peek("id"), Some(json!(0)), "failed bind hydrates nothing");

    // The first binding keeps working.
    first.set("id", json!(8));
    h.settle();
    assert_eq!(h.query(), "id=8");

    // Once released, the key can be bound again.
    handle.dispose();
    h.bind(&second, vec![("id", ParamConfig::default())], BindOptions::new())
        .unwrap();
    assert_eq!(second.peek("id"), Some(json!(8)));
}

#[test]
fn failed_bind_releases_earlier_fields() {
    let h = Harness::new("https://app.test/");
    let taken = h.store(&[("b", json!(0))]);
    h.bind(&taken, vec![("b", ParamConfig::default())], BindOptions::new())
        .unwrap();

    let store = h.store(&[("a", json!(0)), ("b", json!(0))]);
    let err = h
        .bind(
            &store,
            vec![("a", ParamConfig::default()), ("b", ParamConfig::default())],
            BindOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, UrlSyncError::KeyConflict { .. }));
    assert_eq!(h.sync.registry().keys(), vec!["b"]);
}

#[test]
fn distinct_prefixes_share_a_field_name() {
    let h = Harness::new("https://app.test/?left_page=2&right_page=5");
    let left = h.store(&[("page", json!(1))]);
    let right = h.store(&[("page", json!(1))]);
    h.bind(&left, vec![("page", ParamConfig::default())], BindOptions::new().with_prefix("left_"))
        .unwrap();
    h.bind(&right, vec![("page", ParamConfig::default())], BindOptions::new().with_prefix("right_"))
        .unwrap();
    assert_eq!(left.peek("page"), Some(json!(2)));
    assert_eq!(right.peek("page"), Some(json!(5)));
}

#[test]
fn missing_history_degrades_to_inert() {
    let sync = UrlSync::new(None, Rc::new(ManualClock::new()));
    let rt = Runtime::new();
    let store = Rc::new(Store::new(&rt).with_field("q", json!("x")));

    let handle = sync
        .bind(
            store.clone(),
            Rc::new(rt.clone()),
            vec![("q", ParamConfig::default())],
            BindOptions::new(),
        )
        .unwrap();
    assert!(handle.is_inert());
    assert!(sync.history().is_none());

    store.set("q", json!("y"));
    rt.run_until_idle();
    assert_eq!(store.peek("q"), Some(json!("y")));
    assert_eq!(handle.location(), None);
    handle.dispose();
}

#[test]
fn disposed_binding_ignores_url_and_field() {
    let h = Harness::new("https://app.test/?q=1");
    let store = h.store(&[("q", json!(0))]);
    let handle = h
        .bind(&store, vec![("q", ParamConfig::default())], BindOptions::new())
        .unwrap();
    handle.dispose();
    handle.dispose();
    assert!(!handle.is_active());

    h.navigate("https://app.test/?q=2");
    assert_eq!(store.peek("q"), Some(json!(1)));

    store.set("q", json!(3));
    h.settle();
    assert_eq!(h.query(), "q=2");
    assert_eq!(h.sync.bus().listener_count(), 0);
}

#[test]
fn dispose_cancels_pending_debounced_write() {
    let h = Harness::new("https://app.test/?q=1");
    let store = h.store(&[("q", json!(1))]);
    let handle = h
        .bind(
            &store,
            vec![("q", ParamConfig::default())],
            BindOptions::new().with_debounce(DebounceConfig::new(100, 500).unwrap()),
        )
        .unwrap();

    store.set("q", json!(2));
    h.settle();
    assert!(h.sync.next_deadline().is_some());

    handle.dispose();
    assert_eq!(h.sync.next_deadline(), None);
    assert_eq!(h.advance(1_000), 0);
    assert_eq!(h.history.commit_count(), 0);
}

#[test]
fn rebinding_a_released_key_drops_stale_flushes() {
    let h = Harness::new("https://app.test/?q=1");
    let old = h.store(&[("q", json!(1))]);
    let debounce = ParamOptions::new()
        .debounce(ftui_urlsync::DebouncePolicy::Custom(DebounceConfig::new(50, 50).unwrap()));
    let handle = h.bind(&old, vec![("q", debounce.into())], BindOptions::new()).unwrap();
    old.set("q", json!(99));
    h.settle();
    handle.dispose();

    let fresh = h.store(&[("q", json!(0))]);
    h.bind(&fresh, vec![("q", ParamConfig::default())], BindOptions::new())
        .unwrap();
    h.advance(100);
    assert_eq!(h.query(), "q=1");
    assert_eq!(fresh.peek("q"), Some(json!(1)));
}

#[test]
fn runtime_teardown_releases_keys() {
    let h = Harness::new("https://app.test/");
    let store = h.store(&[("a", json!(1)), ("b", json!(2))]);
    let handle = h
        .bind(
            &store,
            vec![("a", ParamConfig::default()), ("b", ParamConfig::default())],
            BindOptions::new(),
        )
        .unwrap();
    assert_eq!(handle.keys(), vec!["a", "b"]);
    assert_eq!(h.rt.observer_count(), 2);

    h.rt.teardown();
    assert!(h.sync.registry().keys().is_empty());
    assert_eq!(h.rt.observer_count(), 0);
}
