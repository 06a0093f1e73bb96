//! Integration tests for the operation surface against the in-memory driver.
//!
//! Covers sync and async calls, both delivery modes, and exactly-once
//! delivery of results.

use docbridge_mongodb::{
    BridgeConfig, BridgeError, DeliveryMode, MemoryDriver, Registry, Reply, Server,
};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to start a registry and an open in-memory connection
fn open_server(delivery: DeliveryMode) -> (Registry, Server, MemoryDriver) {
    init_tracing();
    let config = BridgeConfig::default()
        .with_workers(2)
        .with_delivery(delivery);
    let registry = Registry::start(config).unwrap();
    let driver = MemoryDriver::new();
    let server = Server::new(&registry, driver.clone());
    server
        .open(&[json!({"address": "localhost", "port": 27017})], None)
        .unwrap();
    assert!(server.is_open());
    (registry, server, driver)
}

fn value(reply: Reply) -> JsonValue {
    reply.into_value().expect("synchronous reply")
}

#[test]
fn test_insert_reports_identifier_first() {
    let (_registry, server, driver) = open_server(DeliveryMode::Dedicated);

    let result = value(server.insert(&[json!("test.people"), json!({"name": "Alice"})], None).unwrap());
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["result"], json!(0));
    let id = result["_id"].as_str().unwrap();
    assert_eq!(id.len(), 24);

    let stored = driver.documents("test.people");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].keys().next().map(String::as_str), Some("_id"));
    assert_eq!(stored[0].get_object_id("_id").unwrap().to_hex(), id);
}

#[test]
fn test_retrieve_with_limit() {
    let (_registry, server, _driver) = open_server(DeliveryMode::Dedicated);

    for n in 0..5 {
        server.insert(&[json!("test.numbers"), json!({"n": n})], None).unwrap();
    }

    let result = value(
        server
            .retrieve(&[json!("test.numbers"), json!({}), json!({}), json!(2), json!(0)], None)
            .unwrap(),
    );
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["data"].as_array().unwrap().len(), 2);

    let result = value(server.retrieve(&[json!("test.numbers")], None).unwrap());
    assert_eq!(result["data"].as_array().unwrap().len(), 5);
}

#[test]
fn test_insert_batch_ids_in_order() {
    let (_registry, server, driver) = open_server(DeliveryMode::Dedicated);

    let records = json!([{"n": 1}, {"n": 2}, {"n": 3}, {"n": 4}]);
    let result = value(server.insert_batch(&[json!("test.batch"), records], None).unwrap());
    assert_eq!(result["ok"], json!(true));

    let reported: Vec<String> = result["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["_id"].as_str().unwrap().to_string())
        .collect();
    let stored: Vec<String> = driver
        .documents("test.batch")
        .iter()
        .map(|doc| doc.get_object_id("_id").unwrap().to_hex())
        .collect();
    assert_eq!(reported.len(), 4);
    assert_eq!(reported, stored);
}

#[test]
fn test_argument_faults_are_synchronous() {
    let (registry, server, _driver) = open_server(DeliveryMode::Dedicated);
    let delivered = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&delivered);
    let err = server
        .insert_batch(
            &[json!("test.batch"), json!([])],
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::Argument(_)));
    assert_eq!(
        err.to_string(),
        "Mongo Object Array supplied for Insert Batch Method is empty"
    );

    let err = server.retrieve(&[], None).unwrap_err();
    assert_eq!(err.to_string(), "Mongo Namespace not specified for Retrieve Method");

    let err = server
        .update(
            &[json!("test.c"), json!({}), json!({"$set": {"a": 1}}), json!("MONGO_BOGUS")],
            None,
        )
        .unwrap_err();
    assert!(err.to_string().contains("MONGO_BOGUS"));
    assert!(err.to_string().contains("update"));

    assert!(registry.wait_idle(WAIT));
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(registry.stats().tasks_submitted, 0);
}

#[test]
fn test_async_delivers_exactly_once() {
    let (registry, server, driver) = open_server(DeliveryMode::Dedicated);
    let (tx, rx) = mpsc::channel::<(bool, JsonValue)>();

    const TASKS: usize = 20;
    for n in 0..TASKS {
        let tx = tx.clone();
        let reply = server
            .insert(
                &[json!("test.async"), json!({"n": n})],
                Some(Box::new(move |error, result| {
                    tx.send((error, result)).unwrap();
                })),
            )
            .unwrap();
        assert!(reply.is_pending());
    }
    drop(tx);

    assert!(registry.wait_idle(WAIT));
    let results: Vec<(bool, JsonValue)> = rx.iter().collect();
    assert_eq!(results.len(), TASKS);
    assert!(results.iter().all(|(error, result)| !error && result["ok"] == json!(true)));
    assert_eq!(driver.documents("test.async").len(), TASKS);

    let stats = registry.stats();
    assert_eq!(stats.tasks_submitted, TASKS as u64);
    assert_eq!(stats.tasks_completed, TASKS as u64);
}

#[test]
fn test_async_failure_is_delivered() {
    let (registry, server, _driver) = open_server(DeliveryMode::Dedicated);
    server
        .insert(&[json!("test.dup"), json!({"_id": "52965c27aaaaaaaaaaaaaaaa", "n": 1})], None)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    server
        .insert(
            &[json!("test.dup"), json!({"_id": "52965c27aaaaaaaaaaaaaaaa", "n": 2})],
            Some(Box::new(move |error, result| {
                tx.send((error, result)).unwrap();
            })),
        )
        .unwrap();

    let (error, result) = rx.recv_timeout(WAIT).unwrap();
    assert!(error);
    assert_eq!(result["ok"], json!(false));
    assert_eq!(result["ErrorCode"], json!(11));
    assert!(registry.wait_idle(WAIT));
}

#[test]
fn test_polled_delivery_runs_on_caller() {
    let (registry, server, _driver) = open_server(DeliveryMode::Polled);
    let (tx, rx) = mpsc::channel();
    let caller = std::thread::current().id();

    server
        .version(
            &[],
            Some(Box::new(move |error, result| {
                tx.send((error, result, std::thread::current().id())).unwrap();
            })),
        )
        .unwrap();

    let mut delivered = 0;
    while delivered == 0 {
        delivered = registry.wait_pending(WAIT);
    }
    assert_eq!(delivered, 1);

    let (error, result, thread) = rx.try_recv().unwrap();
    assert!(!error);
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["result"], json!(env!("CARGO_PKG_VERSION")));
    assert_eq!(thread, caller);
}

#[test]
fn test_shutdown_drains_pending_completions() {
    let (registry, server, _driver) = open_server(DeliveryMode::Polled);
    let delivered = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let counter = Arc::clone(&delivered);
        server
            .object_id(
                &[],
                Some(Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
    }

    registry.shutdown();
    assert_eq!(delivered.load(Ordering::SeqCst), 5);
    assert!(server.object_id(&[], None).is_err());
}

#[test]
fn test_shutdown_racing_submissions_delivers_every_accepted_call() {
    init_tracing();
    let registry = Registry::start(BridgeConfig::default().with_workers(2)).unwrap();

    const THREADS: usize = 4;
    const CALLS: usize = 200;
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(THREADS + 1));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let server = Server::new(&registry, MemoryDriver::new());
            let (accepted, rejected, delivered) =
                (Arc::clone(&accepted), Arc::clone(&rejected), Arc::clone(&delivered));
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..CALLS {
                    let counter = Arc::clone(&delivered);
                    let result = server.object_id(
                        &[],
                        Some(Box::new(move |_, _| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })),
                    );
                    match result {
                        Ok(reply) => {
                            assert!(reply.is_pending());
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            assert!(matches!(err, BridgeError::Runtime(_)));
                            rejected.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        })
        .collect();

    start.wait();
    while accepted.load(Ordering::SeqCst) < CALLS / 2 {
        thread::yield_now();
    }
    registry.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }

    let accepted = accepted.load(Ordering::SeqCst);
    assert_eq!(accepted + rejected.load(Ordering::SeqCst), THREADS * CALLS);
    assert_eq!(delivered.load(Ordering::SeqCst), accepted);

    let stats = registry.stats();
    assert_eq!(stats.tasks_submitted, accepted as u64);
    assert_eq!(stats.tasks_completed, accepted as u64);
}

#[test]
fn test_async_batons_are_released() {
    let (registry, server, _driver) = open_server(DeliveryMode::Dedicated);

    for n in 0..10 {
        server
            .insert(&[json!("test.released"), json!({"n": n})], Some(Box::new(|_, _| {})))
            .unwrap();
    }
    assert!(registry.wait_idle(WAIT));

    let stats = registry.stats();
    // The synchronous open is released too
    assert_eq!(stats.batons_released, 11);
    assert_eq!(stats.documents_released, 10);
}

#[test]
fn test_update_remove_and_command() {
    let (_registry, server, driver) = open_server(DeliveryMode::Dedicated);

    server
        .insert_batch(&[json!("test.items"), json!([{"k": "a", "v": 1}, {"k": "b", "v": 2}])], None)
        .unwrap();

    let result = value(
        server
            .update(&[json!("test.items"), json!({"k": "a"}), json!({"$set": {"v": 10}})], None)
            .unwrap(),
    );
    assert_eq!(result, json!({"ok": true, "result": 0}));

    let found = value(server.retrieve(&[json!("test.items"), json!({"k": "a"})], None).unwrap());
    assert_eq!(found["data"][0]["v"], json!(10));

    let result = value(server.remove(&[json!("test.items"), json!({"k": "b"})], None).unwrap());
    assert_eq!(result, json!({"ok": true, "result": 0}));
    assert_eq!(driver.documents("test.items").len(), 1);

    let result = value(server.command(&[json!("test"), json!({"ping": 1})], None).unwrap());
    assert_eq!(result["ok"], json!(true));
    assert_eq!(result["data"]["ok"], json!(1.0));

    server
        .create_index(&[json!("test.items"), json!({"k": 1})], None)
        .unwrap();
    assert!(driver.index_names("test.items").contains(&"k_1".to_string()));
}

#[test]
fn test_close_requires_reopen() {
    let (_registry, server, _driver) = open_server(DeliveryMode::Dedicated);

    server.close(&[], None).unwrap();
    assert!(!server.is_open());

    let err = server.retrieve(&[json!("test.c")], None).unwrap_err();
    assert_eq!(err, BridgeError::NotConnected);

    // Local operations still work
    assert!(server.object_id(&[], None).is_ok());
    let date = value(
        server
            .object_id_date(&[json!("52965c27aaaaaaaaaaaaaaaa")], None)
            .unwrap(),
    );
    assert_eq!(date["ok"], json!(true));
}
