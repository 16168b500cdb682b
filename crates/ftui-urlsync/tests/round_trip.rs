#![forbid(unsafe_code)]

//! Property tests: a value written to the URL hydrates back unchanged.

mod common;

use common::Harness;
use ftui_urlsync::{BindOptions, BindTarget, History, ParamConfig, ParamOptions};
use proptest::prelude::*;
use serde_json::{Value, json};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        ".*".prop_map(Value::String),
        prop::collection::vec("[a-z &=?%#]{0,6}", 0..4)
            .prop_map(|items| Value::Array(items.into_iter().map(Value::String).collect())),
    ]
}

/// Write `value` through one binding, then hydrate a fresh binding from the
/// resulting URL.
fn written_then_rehydrated(value: &Value, config: fn() -> ParamConfig, initial: Value) -> Value {
    let writer = Harness::new("https://app.test/view");
    let store = writer.store(&[("v", initial.clone())]);
    writer.bind(&store, vec![("v", config())], BindOptions::new()).unwrap();
    store.set("v", value.clone());
    writer.settle();

    let reader = Harness::new(writer.history.location().as_str());
    let fresh = reader.store(&[("v", initial)]);
    reader.bind(&fresh, vec![("v", config())], BindOptions::new()).unwrap();
    fresh.peek("v").unwrap()
}

proptest! {
    #[test]
    fn default_handler_round_trips(value in scalar()) {
        let back = written_then_rehydrated(&value, ParamConfig::default, Value::Null);
        prop_assert_eq!(back, value);
    }

    #[test]
    fn multiple_entries_round_trip(items in prop::collection::vec(any::<i32>(), 0..6)) {
        let value = json!(items);
        let back = written_then_rehydrated(
            &value,
            || ParamOptions::new().multiple().into(),
            json!([]),
        );
        prop_assert_eq!(back, value);
    }

    #[test]
    fn prefixed_keys_with_reserved_characters_round_trip(value in any::<i64>(), name in "[a-z&= ]{1,5}") {
        let h = Harness::new("https://app.test/");
        let store = h.store(&[("f", Value::Null)]);
        let key = name.clone();
        h.bind(
            &store,
            vec![("f", ParamOptions::new().key(key).into())],
            BindOptions::new().with_prefix("p&"),
        )
        .unwrap();
        store.set("f", json!(value));
        h.settle();

        let reader = Harness::new(h.history.location().as_str());
        let fresh = reader.store(&[("f", Value::Null)]);
        reader
            .bind(
                &fresh,
                vec![("f", ParamOptions::new().key(name).into())],
                BindOptions::new().with_prefix("p&"),
            )
            .unwrap();
        prop_assert_eq!(fresh.peek("f"), Some(json!(value)));
    }
}
