//! The database driver seam.
//!
//! Operations talk to the database only through [`Driver`]. Two
//! implementations ship with the crate: [`MongoDriver`] over the official
//! `mongodb` client and [`MemoryDriver`], an in-process store.

use async_trait::async_trait;
use bson::raw::RawDocumentBuf;
use bson::Document as BsonDocument;
use docbridge_common::{BridgeError, ErrorCode, Result};

mod client;
mod memory;

pub use client::MongoDriver;
pub use memory::MemoryDriver;

/// Query shape for a find
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    pub projection: Option<BsonDocument>,
    /// 0 means no limit
    pub limit: i32,
    pub skip: i32,
    /// Retrieve option bits
    pub flags: u32,
}

/// Index definition for create-index
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub keys: BsonDocument,
    pub name: Option<String>,
    /// Create-index option bits
    pub flags: u32,
}

impl IndexSpec {
    /// Name used when none is given: `field_dir` pairs joined by `_`
    pub fn resolved_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .keys
                .iter()
                .map(|(field, dir)| match dir {
                    bson::Bson::String(s) => format!("{}_{}", field, s),
                    bson::Bson::Int32(n) => format!("{}_{}", field, n),
                    bson::Bson::Int64(n) => format!("{}_{}", field, n),
                    bson::Bson::Double(n) => format!("{}_{}", field, *n as i64),
                    other => format!("{}_{}", field, other),
                })
                .collect::<Vec<_>>()
                .join("_"),
        }
    }
}

/// Iterator over a query result
#[async_trait]
pub trait DriverCursor: Send {
    /// Next document, or `None` once the cursor is exhausted
    async fn next(&mut self) -> Result<Option<RawDocumentBuf>>;
}

/// Fixed operation set of a database client.
///
/// Calls for one connection are serialized by the caller, so methods take
/// `&mut self`.
#[async_trait]
pub trait Driver: Send {
    async fn connect(&mut self, address: &str, port: u16) -> Result<()>;

    async fn find(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        spec: FindSpec,
    ) -> Result<Box<dyn DriverCursor>>;

    async fn insert(&mut self, namespace: &str, doc: BsonDocument) -> Result<()>;

    async fn insert_batch(&mut self, namespace: &str, docs: Vec<BsonDocument>, flags: u32) -> Result<()>;

    async fn update(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        update: BsonDocument,
        flags: u32,
    ) -> Result<()>;

    async fn remove(&mut self, namespace: &str, filter: BsonDocument) -> Result<()>;

    async fn command(&mut self, database: &str, command: BsonDocument) -> Result<BsonDocument>;

    async fn create_index(&mut self, namespace: &str, index: IndexSpec) -> Result<BsonDocument>;

    async fn destroy(&mut self);
}

/// Split `db.collection`; the collection part may itself contain dots
pub fn split_namespace(namespace: &str) -> Result<(&str, &str)> {
    match namespace.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(BridgeError::driver(ErrorCode::NsInvalid, "")),
    }
}

/// Database part of a namespace (everything before the first `.`)
pub fn database_of(namespace: &str) -> &str {
    namespace.split('.').next().unwrap_or(namespace)
}

/// Whether an update document uses update operators rather than replacing
pub fn is_operator_update(update: &BsonDocument) -> bool {
    update
        .keys()
        .next()
        .map(|key| key.starts_with('$'))
        .unwrap_or(false)
}
