//! Document model ⇄ BSON codec.
//!
//! Encoding walks a [`Document`] into a `bson::Document`, applying the
//! identifier-field rules. Decoding walks raw BSON bytes back into the model
//! without materializing an intermediate `bson::Document`.

use bson::oid::ObjectId;
use bson::raw::{RawArray, RawBsonRef, RawDocument, RawDocumentBuf};
use bson::{Bson, DateTime as BsonDateTime, Document as BsonDocument};
use docbridge_common::{BridgeError, ErrorCode, Result};
use tracing::warn;

use crate::object_id;
use crate::value::{Document, Value};
use crate::DEFAULT_ID_FIELD;

/// Largest encoded document accepted (16 MiB)
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Whether a document is being created (insert) or used as a query/command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Create,
    Query,
}

/// Identifier bookkeeping for one document being encoded.
///
/// Only the top-level identifier is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct IdBinding {
    field: String,
    id: Option<ObjectId>,
}

impl IdBinding {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            id: None,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    /// Canonical text of the bound identifier
    pub fn text(&self) -> Option<String> {
        self.id.map(|oid| oid.to_hex())
    }

    fn bind(&mut self, oid: ObjectId) {
        self.id = Some(oid);
    }
}

impl Default for IdBinding {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD)
    }
}

/// Encodes model documents into BSON, enforcing the size ceiling.
#[derive(Debug, Clone)]
pub struct Encoder {
    max_document_size: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(MAX_DOCUMENT_SIZE)
    }
}

impl Encoder {
    pub fn new(max_document_size: usize) -> Self {
        Self { max_document_size }
    }

    pub fn max_document_size(&self) -> usize {
        self.max_document_size
    }

    /// Encode a top-level document.
    ///
    /// In [`Scope::Create`] the result always starts with the identifier
    /// field: a fresh identifier is prepended when the first declared
    /// property is something else, and it replaces a first-position
    /// identifier whose value is neither a string nor an `ObjectId`.
    pub fn encode_document(&self, doc: &Document, binding: &mut IdBinding, scope: Scope) -> BsonDocument {
        self.encode_level(doc, binding, true, scope)
    }

    /// Encode a value with no identifier handling
    pub fn encode_value(&self, value: &Value) -> Bson {
        let mut scratch = IdBinding::new(String::new());
        self.encode_nested(value, &mut scratch, Scope::Query)
    }

    /// Serialize to BSON bytes, failing when the ceiling is exceeded
    pub fn to_bytes(&self, doc: &BsonDocument) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes)
            .map_err(|e| BridgeError::format(ErrorCode::BsonInvalid, e.to_string()))?;
        if bytes.len() > self.max_document_size {
            return Err(BridgeError::format(
                ErrorCode::BsonTooLarge,
                ErrorCode::BsonTooLarge.default_message(),
            ));
        }
        Ok(bytes)
    }

    pub fn to_raw(&self, doc: &BsonDocument) -> Result<RawDocumentBuf> {
        let bytes = self.to_bytes(doc)?;
        RawDocumentBuf::from_bytes(bytes).map_err(invalid)
    }

    fn encode_level(&self, doc: &Document, binding: &mut IdBinding, top: bool, scope: Scope) -> BsonDocument {
        let mut out = BsonDocument::new();
        let creating = top && scope == Scope::Create;

        if creating {
            let needs_fresh = match doc.first() {
                Some((key, value)) if key == binding.field() => {
                    !matches!(value, Value::String(_) | Value::ObjectId(_))
                }
                _ => true,
            };
            if needs_fresh {
                let oid = object_id::generate();
                binding.bind(oid);
                out.insert(binding.field().to_string(), Bson::ObjectId(oid));
            }
        }

        for (key, value) in doc.iter() {
            if key == binding.field() {
                match value {
                    Value::String(text) => {
                        let oid = resolve_identifier(key, text);
                        if top {
                            binding.bind(oid);
                        }
                        out.insert(key, Bson::ObjectId(oid));
                        continue;
                    }
                    Value::ObjectId(oid) => {
                        if top {
                            binding.bind(*oid);
                        }
                        out.insert(key, Bson::ObjectId(*oid));
                        continue;
                    }
                    // Keeps the synthesized identifier in place
                    _ if creating => continue,
                    _ => {}
                }
            }
            let encoded = self.encode_nested(value, binding, scope);
            out.insert(key, encoded);
        }
        out
    }

    fn encode_nested(&self, value: &Value, binding: &mut IdBinding, scope: Scope) -> Bson {
        match value {
            Value::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(|item| self.encode_nested(item, binding, scope))
                    .collect(),
            ),
            Value::Document(doc) => Bson::Document(self.encode_level(doc, binding, false, scope)),
            Value::Int32(n) => Bson::Int32(*n),
            Value::Int64(n) => Bson::Int64(*n),
            Value::Double(n) => Bson::Double(*n),
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Null => Bson::Null,
            Value::Timestamp(ms) => Bson::DateTime(BsonDateTime::from_millis(*ms)),
            Value::ObjectId(oid) => Bson::ObjectId(*oid),
            Value::String(s) | Value::Unrecognized(s) => Bson::String(s.clone()),
        }
    }
}

/// Validate identifier text, silently substituting a fresh identifier.
///
/// Callers depend on this leniency; an invalid identifier is never an error.
fn resolve_identifier(field: &str, text: &str) -> ObjectId {
    match object_id::validate(text) {
        Ok(oid) => oid,
        Err(_) => {
            let oid = object_id::generate();
            warn!(field, supplied = text, generated = %oid, "Invalid identifier replaced");
            oid
        }
    }
}

fn invalid(err: impl std::fmt::Display) -> BridgeError {
    BridgeError::format(ErrorCode::BsonInvalid, format!("Invalid BSON: {}", err))
}

/// Decode BSON bytes into a model document
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let raw = RawDocument::from_bytes(bytes).map_err(invalid)?;
    decode_raw(raw)
}

/// Decode an already validated raw document
pub fn decode_raw(raw: &RawDocument) -> Result<Document> {
    let mut doc = Document::new();
    for element in raw {
        let (key, value) = element.map_err(invalid)?;
        doc.insert(key, decode_element(value)?);
    }
    Ok(doc)
}

pub fn decode_array(array: &RawArray) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    for element in array {
        items.push(decode_element(element.map_err(invalid)?)?);
    }
    Ok(items)
}

fn decode_element(value: RawBsonRef<'_>) -> Result<Value> {
    let decoded = match value {
        RawBsonRef::ObjectId(oid) => Value::String(oid.to_hex()),
        RawBsonRef::String(s) => Value::String(s.to_string()),
        RawBsonRef::Int32(n) => Value::Int32(n),
        // Widened: precision above 2^53 is lost
        RawBsonRef::Int64(n) => Value::Double(n as f64),
        RawBsonRef::Double(n) => Value::Double(n),
        RawBsonRef::Boolean(b) => Value::Bool(b),
        RawBsonRef::Null => Value::Null,
        RawBsonRef::DateTime(dt) => Value::Timestamp(dt.timestamp_millis()),
        RawBsonRef::Array(array) => Value::Array(decode_array(array)?),
        RawBsonRef::Document(doc) => Value::Document(decode_raw(doc)?),
        other => Value::Unrecognized(format!("BSON Type: {}", other.element_type() as u8)),
    };
    Ok(decoded)
}
