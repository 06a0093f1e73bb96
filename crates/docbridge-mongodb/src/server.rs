//! Connection object and the public operation surface.

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use docbridge_bson::Encoder;
use docbridge_common::{BridgeError, Result};

use crate::driver::{Driver, MemoryDriver, MongoDriver};
use crate::operation::{self, BuildContext, OpKind};
use crate::runtime::{Outcome, Registry};

pub use crate::baton::Continuation;

/// What a call returns to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Synchronous result
    Value(JsonValue),
    /// Scheduled; the continuation receives the result
    Pending,
}

impl Reply {
    pub fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending)
    }

    pub fn into_value(self) -> Option<JsonValue> {
        match self {
            Reply::Value(value) => Some(value),
            Reply::Pending => None,
        }
    }
}

/// State shared between a [`Server`] and its in-flight tasks
pub(crate) struct ConnectionState {
    pub(crate) driver: tokio::sync::Mutex<Box<dyn Driver>>,
    open: AtomicBool,
    target: Mutex<Option<(String, u16)>>,
}

impl ConnectionState {
    fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver: tokio::sync::Mutex::new(driver),
            open: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }

    pub(crate) fn mark_open(&self, target: Option<(String, u16)>) {
        if let Some((address, port)) = &target {
            info!(address = %address, port, "Connection opened");
        }
        *self.target.lock() = target;
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Connection closed");
        }
    }
}

/// One database connection and the operations that run against it.
///
/// Every method takes positional host arguments and an optional
/// continuation. Without a continuation the call runs on the calling thread
/// and returns [`Reply::Value`]; with one it is scheduled on the registry's
/// workers and returns [`Reply::Pending`]. Argument problems are returned as
/// `Err` before anything is scheduled.
pub struct Server {
    registry: Registry,
    state: Arc<ConnectionState>,
    context: BuildContext,
}

impl Server {
    pub fn new<D: Driver + 'static>(registry: &Registry, driver: D) -> Self {
        let config = registry.config();
        let context = BuildContext {
            id_field: config.id_field.clone(),
            encoder: Encoder::new(config.max_document_size),
        };
        registry.connection_created();
        Self {
            registry: registry.clone(),
            state: Arc::new(ConnectionState::new(Box::new(driver))),
            context,
        }
    }

    /// Connection backed by the `mongodb` driver
    pub fn mongo(registry: &Registry) -> Self {
        let driver = MongoDriver::new(registry.config().app_name.clone());
        Self::new(registry, driver)
    }

    /// Connection backed by the in-memory driver
    pub fn memory(registry: &Registry) -> Self {
        Self::new(registry, MemoryDriver::new())
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Address and port of the last successful open
    pub fn address(&self) -> Option<(String, u16)> {
        self.state.target.lock().clone()
    }

    pub fn id_field(&self) -> &str {
        &self.context.id_field
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dispatch by method name, e.g. `"find"` or `"insert_batch"`
    pub fn call(&self, method: &str, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        let kind = OpKind::from_name(method)
            .ok_or_else(|| BridgeError::Argument(format!("Unknown method ({})", method)))?;
        self.invoke(kind, args, continuation)
    }

    pub fn about(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::About, args, continuation)
    }

    pub fn version(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Version, args, continuation)
    }

    /// `[{address, port}]`
    pub fn open(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Open, args, continuation)
    }

    pub fn close(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Close, args, continuation)
    }

    /// `[namespace, id_field?, reference?, projection?, limit?, skip?, options?]`
    pub fn retrieve(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Retrieve, args, continuation)
    }

    /// Same as [`Server::retrieve`]
    pub fn find(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Retrieve, args, continuation)
    }

    /// `[namespace, id_field?, document, options?]`
    pub fn insert(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Insert, args, continuation)
    }

    /// `[namespace, id_field?, [documents], options?]`
    pub fn insert_batch(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::InsertBatch, args, continuation)
    }

    /// `[namespace, id_field?, reference, document, options?]`
    pub fn update(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Update, args, continuation)
    }

    /// `[namespace, id_field?, reference]`
    pub fn remove(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Remove, args, continuation)
    }

    /// `[database, id_field?, command]`
    pub fn command(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::Command, args, continuation)
    }

    /// `[namespace, id_field?, keys, name?, options?]`
    pub fn create_index(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::CreateIndex, args, continuation)
    }

    pub fn object_id(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::ObjectId, args, continuation)
    }

    /// `[object_id_text]`
    pub fn object_id_date(&self, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        self.invoke(OpKind::ObjectIdDate, args, continuation)
    }

    fn invoke(&self, kind: OpKind, args: &[JsonValue], continuation: Option<Continuation>) -> Result<Reply> {
        debug!(
            op = kind.name(),
            namespace = args.first().and_then(JsonValue::as_str).unwrap_or(""),
            async_call = continuation.is_some(),
            "Dispatching operation"
        );

        if kind.requires_connection() && !self.is_open() {
            return Err(BridgeError::NotConnected);
        }

        let mut baton = operation::build(kind, args, &self.context)?;

        match continuation {
            None => {
                let outcome = self.registry.run_sync(baton, &self.state)?;
                let value = match &outcome {
                    Outcome::Done(baton) if kind.returns_text() && baton.error().is_none() => {
                        JsonValue::String(baton.output.clone())
                    }
                    _ => outcome.shape().1,
                };
                self.registry.retire(outcome);
                Ok(Reply::Value(value))
            }
            Some(continuation) => {
                baton.continuation = Some(continuation);
                self.registry.submit(baton, Arc::clone(&self.state))?;
                Ok(Reply::Pending)
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("open", &self.is_open())
            .field("address", &self.address())
            .field("id_field", &self.context.id_field)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::start(BridgeConfig::default().with_workers(1)).unwrap()
    }

    #[test]
    fn test_text_replies() {
        let registry = registry();
        let server = Server::memory(&registry);

        let about = server.about(&[], None).unwrap().into_value().unwrap();
        assert!(about.as_str().unwrap().starts_with("docbridge: Version: "));

        let version = server.version(&[], None).unwrap().into_value().unwrap();
        assert_eq!(version, json!(env!("CARGO_PKG_VERSION")));

        let id = server.object_id(&[], None).unwrap().into_value().unwrap();
        assert_eq!(id.as_str().unwrap().len(), 24);
    }

    #[test]
    fn test_requires_open_connection() {
        let registry = registry();
        let server = Server::memory(&registry);
        let err = server.insert(&[json!("db.coll"), json!({"a": 1})], None).unwrap_err();
        assert_eq!(err, BridgeError::NotConnected);
        assert_eq!(err.to_string(), "Connection not established to Mongo Database");
    }

    #[test]
    fn test_open_and_close() {
        let registry = registry();
        let server = Server::memory(&registry);

        let reply = server
            .open(&[json!({"address": "localhost", "port": 27017})], None)
            .unwrap();
        assert_eq!(reply, Reply::Value(json!({"ok": true, "result": 0})));
        assert!(server.is_open());
        assert_eq!(server.address(), Some(("localhost".to_string(), 27017)));

        server.close(&[], None).unwrap();
        assert!(!server.is_open());
        assert_eq!(registry.stats().connections_created, 1);
    }

    #[test]
    fn test_failed_open_stays_closed() {
        let registry = registry();
        let server = Server::memory(&registry);
        let value = server
            .open(&[json!({"address": "localhost", "port": 0})], None)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["ErrorCode"], json!(2));
        assert!(!server.is_open());
    }

    #[test]
    fn test_call_by_method_name() {
        let registry = registry();
        let server = Server::memory(&registry);
        server
            .call("open", &[json!({"address": "localhost", "port": 27017})], None)
            .unwrap();
        server
            .call("insert", &[json!("db.people"), json!({"name": "Alice"})], None)
            .unwrap();

        let found = server.call("find", &[json!("db.people")], None).unwrap().into_value().unwrap();
        assert_eq!(found["data"][0]["name"], json!("Alice"));
        let same = server.find(&[json!("db.people")], None).unwrap().into_value().unwrap();
        assert_eq!(same["data"], found["data"]);

        let err = server.call("drop", &[], None).unwrap_err();
        assert_eq!(err.to_string(), "Unknown method (drop)");
    }

    #[test]
    fn test_sync_batons_are_released() {
        let registry = registry();
        let server = Server::memory(&registry);
        server
            .open(&[json!({"address": "localhost", "port": 27017})], None)
            .unwrap();
        server
            .insert_batch(&[json!("db.c"), json!([{"n": 1}, {"n": 2}])], None)
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.batons_released, 2);
        assert_eq!(stats.documents_released, 2);
    }

    #[test]
    fn test_calls_after_shutdown_fault() {
        let registry = registry();
        let server = Server::memory(&registry);
        registry.shutdown();
        let err = server.version(&[], None).unwrap_err();
        assert!(matches!(err, BridgeError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_sync_call_inside_runtime_faults() {
        let registry = tokio::task::spawn_blocking(registry).await.unwrap();
        let server = Server::memory(&registry);
        let err = server
            .open(&[json!({"address": "localhost", "port": 27017})], None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Runtime(_)));

        // Operations that never reach the driver still answer inline
        let version = server.version(&[], None).unwrap().into_value().unwrap();
        assert_eq!(version, json!(env!("CARGO_PKG_VERSION")));
        let id = server.object_id(&[], None).unwrap().into_value().unwrap();
        assert_eq!(id.as_str().unwrap().len(), 24);
        tokio::task::spawn_blocking(move || {
            drop(server);
            registry.shutdown();
        })
        .await
        .unwrap();
    }
}
