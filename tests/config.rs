use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use filament::config;
use filament::Error;

#[test]
fn lookup_registers_and_returns_the_same_handle() {
    let a = config::lookup("tests.lookup.port", 8080u32, "listen port").unwrap();
    assert_eq!(a.value(), 8080);
    assert_eq!(a.name(), "tests.lookup.port");
    assert_eq!(a.description(), "listen port");

    // the default of a later lookup is ignored
    let b = config::lookup("tests.lookup.port", 1u32, "").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.value(), 8080);

    let c = config::get::<u32>("tests.lookup.port").unwrap();
    assert!(Arc::ptr_eq(&a, &c));
    assert!(config::get::<u32>("tests.lookup.missing").is_none());
}

#[test]
fn type_mismatch_yields_no_handle() {
    config::lookup("tests.mismatch.value", 17u32, "").unwrap();
    assert!(config::lookup("tests.mismatch.value", String::new(), "").is_none());

    let error = config::try_lookup("tests.mismatch.value", String::new(), "").unwrap_err();
    assert!(matches!(error, Error::ConfigTypeMismatch { .. }));
}

#[test]
fn invalid_names_are_rejected() {
    assert!(config::lookup("has space", 1u32, "").is_none());
    let error = config::try_lookup("dash-ed", 1u32, "").unwrap_err();
    assert!(matches!(error, Error::InvalidConfigName(_)));
}

#[test]
fn listeners_observe_old_and_new() {
    let var = config::lookup("tests.listeners.value", 1u64, "").unwrap();

    let observed: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let listener_observed = observed.clone();
    let listener = var.add_listener(move |old, new| {
        listener_observed.lock().unwrap().push((*old, *new));
    });

    var.set(2);
    // setting the same value again is not a change
    var.set(2);
    var.set(5);
    assert_eq!(*observed.lock().unwrap(), vec![(1, 2), (2, 5)]);

    var.remove_listener(listener);
    var.set(9);
    assert_eq!(observed.lock().unwrap().len(), 2);
}

#[test]
fn json_round_trip() {
    let var = config::lookup("tests.json.value", 100u32, "").unwrap();
    assert_eq!(var.to_json().unwrap(), "100");

    var.set_from_json("250").unwrap();
    assert_eq!(var.value(), 250);

    assert!(var.set_from_json("\"not a number\"").is_err());
    assert_eq!(var.value(), 250);
}

#[test]
fn load_applies_nested_documents() {
    let port = config::lookup("tests.doc.port", 8080u32, "").unwrap();
    let host = config::lookup("tests.doc.host", "localhost".to_string(), "").unwrap();
    let fires = Arc::new(AtomicUsize::new(0));
    let listener_fires = fires.clone();
    port.add_listener(move |_, _| {
        listener_fires.fetch_add(1, Ordering::SeqCst);
    });

    config::load(&serde_json::json!({
        "tests": {
            "doc": {
                "port": 9090,
                "host": "example.org",
                // names that were never registered are skipped
                "unregistered": true,
            },
            "doc2": "whatever",
        }
    }));

    assert_eq!(port.value(), 9090);
    assert_eq!(host.value(), "example.org");
    assert_eq!(fires.load(Ordering::SeqCst), 1);
}

#[test]
fn structured_values_work() {
    #[derive(Clone, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
    struct Limits {
        soft: u32,
        hard: u32,
    }

    let var = config::lookup(
        "tests.struct.limits",
        Limits { soft: 10, hard: 20 },
        "resource limits",
    )
    .unwrap();

    config::load(&serde_json::json!({
        "tests": { "struct": { "limits": { "soft": 15, "hard": 30 } } }
    }));
    assert_eq!(var.value(), Limits { soft: 15, hard: 30 });
}
