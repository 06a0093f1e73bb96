//! Per-invocation task context.
//!
//! A [`Baton`] carries everything one operation needs: the request documents
//! (stored in its [`DocumentArena`]), parsed options, identifier bindings,
//! driver output and the continuation for async calls. It is owned by exactly
//! one invocation and dropped once after its result has been delivered,
//! which releases the arena.

use bson::Document as BsonDocument;
use docbridge_bson::{DocHandle, DocumentArena, Encoder, IdBinding};
use docbridge_common::{BridgeError, ErrorCode, Result};
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::operation::OpKind;

/// Receives `(error, result)` once an async operation completes
pub type Continuation = Box<dyn FnOnce(bool, JsonValue) + Send + 'static>;

pub struct Baton {
    pub(crate) kind: OpKind,
    pub(crate) namespace: String,
    pub(crate) id_field: String,
    pub(crate) encoder: Encoder,
    pub(crate) arena: DocumentArena,

    // Request
    pub(crate) reference: Option<DocHandle>,
    pub(crate) main: Option<DocHandle>,
    pub(crate) projection: Option<DocHandle>,
    pub(crate) batch: Vec<DocHandle>,
    pub(crate) bindings: Vec<IdBinding>,
    pub(crate) options: u32,
    pub(crate) limit: i32,
    pub(crate) skip: i32,
    pub(crate) index_name: Option<String>,
    pub(crate) target: Option<(String, u16)>,

    // Response
    pub(crate) output: String,
    pub(crate) results: Vec<DocHandle>,
    pub(crate) response: Option<DocHandle>,
    pub(crate) error: Option<BridgeError>,

    pub(crate) continuation: Option<Continuation>,
}

impl Baton {
    pub(crate) fn new(kind: OpKind, id_field: &str, encoder: Encoder) -> Self {
        Self {
            kind,
            namespace: String::new(),
            id_field: id_field.to_string(),
            encoder,
            arena: DocumentArena::new(),
            reference: None,
            main: None,
            projection: None,
            batch: Vec::new(),
            bindings: Vec::new(),
            options: 0,
            limit: 0,
            skip: 0,
            index_name: None,
            target: None,
            output: String::new(),
            results: Vec::new(),
            response: None,
            error: None,
            continuation: None,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn error(&self) -> Option<&BridgeError> {
        self.error.as_ref()
    }

    /// Number of documents held in the arena
    pub fn allocated(&self) -> usize {
        self.arena.len()
    }

    /// Serialize a request document into the arena
    pub(crate) fn store(&mut self, doc: &BsonDocument) -> Result<DocHandle> {
        let raw = self.encoder.to_raw(doc)?;
        Ok(self.arena.push(raw))
    }

    /// Materialize a stored document for the driver
    pub(crate) fn load(&self, handle: DocHandle) -> Result<BsonDocument> {
        let raw = self
            .arena
            .get(handle)
            .ok_or_else(|| BridgeError::format(ErrorCode::BsonNotFinished, ErrorCode::BsonNotFinished.default_message()))?;
        BsonDocument::try_from(raw)
            .map_err(|e| BridgeError::format(ErrorCode::BsonInvalid, e.to_string()))
    }

    pub(crate) fn load_optional(&self, handle: Option<DocHandle>) -> Result<Option<BsonDocument>> {
        handle.map(|h| self.load(h)).transpose()
    }

    /// Release the arena. Returns the number of documents freed; later calls
    /// free nothing.
    pub(crate) fn release(&mut self) -> usize {
        let released = self.arena.close();
        if released > 0 {
            trace!(op = self.kind.name(), released, "Baton released");
        }
        released
    }

    /// Record a failure; the first one wins
    pub(crate) fn fail(&mut self, err: BridgeError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

impl std::fmt::Debug for Baton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Baton")
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .field("id_field", &self.id_field)
            .field("documents", &self.arena.len())
            .field("options", &self.options)
            .field("error", &self.error)
            .field("continuation", &self.continuation.as_ref().map(|_| "Some(Continuation)"))
            .finish()
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        self.release();
    }
}
