//! Integration tests against a running MongoDB server.
//!
//! These tests require a MongoDB server to be running.
//! Set DOCBRIDGE_TEST_ADDRESS / DOCBRIDGE_TEST_PORT (default localhost:27017)
//! and run with --ignored.

use docbridge_mongodb::{BridgeConfig, Registry, Server};
use serde_json::{json, Value as JsonValue};
use std::sync::mpsc;
use std::time::Duration;

fn target() -> JsonValue {
    let address = std::env::var("DOCBRIDGE_TEST_ADDRESS").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("DOCBRIDGE_TEST_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(27017);
    json!({"address": address, "port": port})
}

fn connect() -> (Registry, Server) {
    let registry = Registry::start(BridgeConfig::default().with_workers(2)).unwrap();
    let server = Server::mongo(&registry);
    let opened = server.open(&[target()], None).unwrap().into_value().unwrap();
    assert_eq!(opened["ok"], json!(true), "open failed: {}", opened);
    (registry, server)
}

#[test]
#[ignore] // Only run with --ignored flag when database is available
fn test_insert_retrieve_remove() {
    let (_registry, server) = connect();
    let ns = json!("docbridge_test.people");

    server.remove(&[ns.clone(), json!({})], None).unwrap();

    let inserted = server
        .insert(&[ns.clone(), json!({"name": "Alice", "age": 30})], None)
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(inserted["ok"], json!(true));
    let id = inserted["_id"].as_str().unwrap().to_string();

    let found = server
        .retrieve(&[ns.clone(), json!({"_id": id.clone()})], None)
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(found["data"][0]["_id"], json!(id));
    assert_eq!(found["data"][0]["name"], json!("Alice"));

    let removed = server.remove(&[ns.clone(), json!({})], None).unwrap().into_value().unwrap();
    assert_eq!(removed, json!({"ok": true, "result": 0}));

    server.close(&[], None).unwrap();
    assert!(!server.is_open());
}

#[test]
#[ignore]
fn test_async_command_and_index() {
    let (registry, server) = connect();
    let (tx, rx) = mpsc::channel();

    let ping_tx = tx.clone();
    server
        .command(
            &[json!("admin"), json!({"ping": 1})],
            Some(Box::new(move |error, result| {
                ping_tx.send((error, result)).unwrap();
            })),
        )
        .unwrap();
    server
        .create_index(
            &[json!("docbridge_test.people"), json!({"name": 1}), json!("by_name"), json!("MONGO_INDEX_BACKGROUND")],
            Some(Box::new(move |error, result| {
                tx.send((error, result)).unwrap();
            })),
        )
        .unwrap();

    for _ in 0..2 {
        let (error, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(!error, "operation failed: {}", result);
        assert_eq!(result["ok"], json!(true));
    }
    assert!(registry.wait_idle(Duration::from_secs(10)));
}

#[test]
#[ignore]
fn test_open_unreachable_server_fails() {
    let registry = Registry::start(BridgeConfig::default().with_workers(1)).unwrap();
    let server = Server::new(
        &registry,
        docbridge_mongodb::MongoDriver::new(None).with_connect_timeout(Duration::from_millis(200)),
    );
    let result = server
        .open(&[json!({"address": "127.0.0.1", "port": 1})], None)
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(result["ok"], json!(false));
    assert!(!server.is_open());
}
