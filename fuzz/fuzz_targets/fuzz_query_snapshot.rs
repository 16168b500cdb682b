#![no_main]

//! Arbitrary query strings and parameter edits must never panic, and every
//! edit must read back exactly as written.

use arbitrary::Arbitrary;
use ftui_urlsync::snapshot::{
    ParamValue, ParamWrite, UrlSnapshot, apply_writes, fragment_values, query_fragment,
};
use libfuzzer_sys::fuzz_target;
use url::Url;

#[derive(Debug, Arbitrary)]
enum Edit {
    Set { key: String, value: String },
    SetMany { key: String, values: Vec<String> },
    Delete { key: String },
}

impl Edit {
    fn into_write(self) -> ParamWrite {
        match self {
            Self::Set { key, value } => ParamWrite::set(key, ParamValue::Single(value)),
            Self::SetMany { key, values } if values.is_empty() => ParamWrite::delete(key),
            Self::SetMany { key, values } => ParamWrite::set(key, ParamValue::Multiple(values)),
            Self::Delete { key } => ParamWrite::delete(key),
        }
    }
}

#[derive(Debug, Arbitrary)]
struct Case {
    query: String,
    edits: Vec<Edit>,
}

fuzz_target!(|case: Case| {
    let snapshot = UrlSnapshot::from_query(&case.query);
    for (key, value) in snapshot.iter() {
        let fragment = query_fragment(key, Some(value)).expect("present value has a fragment");
        assert_eq!(fragment_values(&fragment), value.values(), "fragment of {key:?}");
    }

    let Ok(mut url) = Url::parse("https://fuzz.test/") else {
        return;
    };
    url.set_query(Some(&case.query));

    for write in case.edits.into_iter().take(16).map(Edit::into_write) {
        url = apply_writes(&url, std::slice::from_ref(&write));
        let after = UrlSnapshot::from_url(&url);
        match &write.value {
            None => assert!(!after.contains(&write.key)),
            Some(value) => assert_eq!(
                after.get(&write.key).map(ParamValue::values),
                Some(value.values())
            ),
        }
    }
});
