#![forbid(unsafe_code)]

//! Legacy key migration and prefix rewrites.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::Harness;
use ftui_urlsync::{
    BindOptions, BindTarget, HistoryMode, LegacyKey, ParamConfig, ParamOptions, Prefix,
    UrlSnapshot, UrlSyncError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn snapshot(h: &Harness) -> UrlSnapshot {
    UrlSnapshot::from_query(&h.query())
}

#[test]
fn legacy_key_hydrates_and_is_removed() {
    let h = Harness::new("https://app.test/?greeting=hi");
    let store = h.store(&[("hello", json!(""))]);
    h.bind(
        &store,
        vec![("hello", ParamOptions::new().legacy_key(LegacyKey::new("greeting")).into())],
        BindOptions::new(),
    )
    .unwrap();
    h.settle();

    assert_eq!(store.peek("hello"), Some(json!("hi")));
    let snap = snapshot(&h);
    assert!(snap.contains("hello"));
    assert!(!snap.contains("greeting"));
    assert!(
        h.history.commits().iter().all(|c| c.mode == HistoryMode::Replace),
        "migration must not add history entries"
    );
    assert_eq!(h.history.len(), 1);
}

#[test]
fn current_key_wins_over_legacy() {
    let h = Harness::new("https://app.test/?old=1&new=2");
    let store = h.store(&[("new", json!(0))]);
    h.bind(
        &store,
        vec![("new", ParamOptions::new().legacy_key(LegacyKey::new("old")).into())],
        BindOptions::new(),
    )
    .unwrap();
    assert_eq!(store.peek("new"), Some(json!(2)));
    assert_eq!(h.query(), "new=2");
}

#[test]
fn legacy_removals_are_batched_per_history_mode() {
    let h = Harness::new("https://app.test/?o1=1&o2=2&o3=3&keep=1");
    let store = h.store(&[("a", json!(0)), ("b", json!(0))]);
    h.bind(
        &store,
        vec![
            (
                "a",
                ParamOptions::new()
                    .legacy_key(LegacyKey::new("o1"))
                    .legacy_key(LegacyKey::new("o2").without_hydrate())
                    .into(),
            ),
            (
                "b",
                ParamOptions::new()
                    .legacy_key(LegacyKey::new("o3").removal_history(HistoryMode::Push))
                    .legacy_key(LegacyKey::new("keep").keep())
                    .into(),
            ),
        ],
        BindOptions::new(),
    )
    .unwrap();

    let commits = h.history.commits();
    let modes: Vec<HistoryMode> = commits.iter().map(|c| c.mode).collect();
    // Replace batch, push batch, then the setup writes for a and b.
    assert_eq!(
        modes,
        vec![
            HistoryMode::Replace,
            HistoryMode::Push,
            HistoryMode::Replace,
            HistoryMode::Replace
        ]
    );
    assert_eq!(commits[0].url.query(), Some("o3=3&keep=1"));
    assert_eq!(commits[1].url.query(), Some("keep=1"));
    assert_eq!(store.peek("a"), Some(json!(1)));
    assert_eq!(store.peek("b"), Some(json!(1)), "kept legacy keys still hydrate");
    assert!(snapshot(&h).contains("keep"));
}

#[test]
fn prefix_change_is_one_replace_navigation() {
    let h = Harness::new("https://app.test/?a_x=1&a_y=2&z=0");
    let store = h.store(&[("x", json!(0)), ("y", json!(0))]);
    let handle = h
        .bind(
            &store,
            vec![("x", ParamConfig::default()), ("y", ParamConfig::default())],
            BindOptions::new().with_prefix("a_"),
        )
        .unwrap();
    assert_eq!(h.history.commit_count(), 0);

    handle.set_prefix("b_").unwrap();
    let commits = h.history.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].mode, HistoryMode::Replace);
    assert_eq!(commits[0].url.query(), Some("z=0&b_x=1&b_y=2"));
    assert_eq!(handle.keys(), vec!["b_x", "b_y"]);
    assert_eq!(handle.prefix().as_deref(), Some("b_"));

    // Later writes use the new key.
    store.set("x", json!(5));
    h.settle();
    assert_eq!(h.query(), "z=0&b_x=5&b_y=2");
}

#[test]
fn reactive_prefix_follows_state() {
    let h = Harness::new("https://app.test/?a_x=1");
    let store = h.store(&[("x", json!(0)), ("ns", json!("a_"))]);
    let ns = store.clone();
    let prefix = Prefix::reactive(move || {
        ns.get("ns")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    });
    let handle = h
        .bind(&store, vec![("x", ParamConfig::default())], BindOptions::new().with_prefix(prefix))
        .unwrap();
    assert_eq!(store.peek("x"), Some(json!(1)));

    store.set("ns", json!("b_"));
    h.settle();
    assert_eq!(h.query(), "b_x=1");
    assert_eq!(h.history.commit_count(), 1);
    assert_eq!(handle.keys(), vec!["b_x"]);
}

#[test]
fn field_edits_do_not_rerun_reactive_prefix() {
    let h = Harness::new("https://app.test/?a_x=1");
    let store = h.store(&[("x", json!(0)), ("ns", json!("a_"))]);
    let runs = Rc::new(Cell::new(0));
    let (ns, r) = (store.clone(), Rc::clone(&runs));
    let prefix = Prefix::reactive(move || {
        r.set(r.get() + 1);
        ns.get("ns")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    });
    h.bind(&store, vec![("x", ParamConfig::default())], BindOptions::new().with_prefix(prefix))
        .unwrap();

    store.set("ns", json!("b_"));
    h.settle();
    assert_eq!(h.query(), "b_x=1");
    let after_rename = runs.get();

    store.set("x", json!(5));
    h.settle();
    store.set("x", json!(6));
    h.settle();
    assert_eq!(h.query(), "b_x=6");
    assert_eq!(runs.get(), after_rename);
}

#[test]
fn conflicting_prefix_keeps_old_keys() {
    let h = Harness::new("https://app.test/?a_x=1&b_x=9");
    let other = h.store(&[("x", json!(0))]);
    h.bind(&other, vec![("x", ParamConfig::default())], BindOptions::new().with_prefix("b_"))
        .unwrap();

    let store = h.store(&[("x", json!(0))]);
    let handle = h
        .bind(&store, vec![("x", ParamConfig::default())], BindOptions::new().with_prefix("a_"))
        .unwrap();

    let err = handle.set_prefix("b_").unwrap_err();
    assert_eq!(err, UrlSyncError::KeyConflict { key: "b_x".into() });
    assert_eq!(handle.keys(), vec!["a_x"]);
    assert_eq!(h.history.commit_count(), 0);

    // The restored binding still owns its key.
    store.set("x", json!(2));
    h.settle();
    assert_eq!(h.history.commit_count(), 1);
    assert_eq!(h.query(), "a_x=2&b_x=9");
    assert_eq!(other.peek("x"), Some(json!(9)));
}
