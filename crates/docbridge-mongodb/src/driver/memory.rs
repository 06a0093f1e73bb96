//! In-process driver.
//!
//! Stores documents per namespace behind a shared lock. Filters support
//! top-level equality plus `$eq $ne $gt $gte $lt $lte $in $exists`; updates
//! support replacement plus `$set $unset $inc`. Clones share one store, so a
//! test can inspect what a connection wrote.

use async_trait::async_trait;
use bson::raw::RawDocumentBuf;
use bson::{doc, Bson, Document as BsonDocument};
use docbridge_common::{BridgeError, ErrorCode, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use super::{database_of, is_operator_update, split_namespace, Driver, DriverCursor, FindSpec, IndexSpec};
use crate::options::{MONGO_CONTINUE_ON_ERROR, MONGO_UPDATE_MULTI, MONGO_UPDATE_UPSERT};

#[derive(Debug, Default)]
struct Store {
    collections: HashMap<String, Vec<BsonDocument>>,
    indexes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<Store>>,
    connected: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a collection in insertion order
    pub fn documents(&self, namespace: &str) -> Vec<BsonDocument> {
        self.store
            .lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    pub fn index_names(&self, namespace: &str) -> Vec<String> {
        self.store
            .lock()
            .indexes
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }
}

struct MemoryCursor {
    pending: VecDeque<RawDocumentBuf>,
}

#[async_trait]
impl DriverCursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<RawDocumentBuf>> {
        Ok(self.pending.pop_front())
    }
}

fn to_raw(doc: &BsonDocument) -> Result<RawDocumentBuf> {
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)?;
    RawDocumentBuf::from_bytes(bytes)
        .map_err(|e| BridgeError::format(ErrorCode::BsonInvalid, e.to_string()))
}

fn duplicate_key(namespace: &str, id: &Bson) -> BridgeError {
    BridgeError::driver(
        ErrorCode::WriteError,
        format!(
            "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
            namespace, id
        ),
    )
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn equals(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Some(Ordering::Equal) || a == b
}

fn is_operator_doc(value: &Bson) -> Option<&BsonDocument> {
    match value {
        Bson::Document(d) if d.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => Some(d),
        _ => None,
    }
}

fn matches_condition(field: Option<&Bson>, condition: &Bson) -> bool {
    let Some(operators) = is_operator_doc(condition) else {
        return field.map(|value| equals(value, condition)).unwrap_or(false);
    };
    operators.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => field.map(|v| equals(v, operand)).unwrap_or(false),
        "$ne" => !field.map(|v| equals(v, operand)).unwrap_or(false),
        "$gt" => field.and_then(|v| compare(v, operand)) == Some(Ordering::Greater),
        "$gte" => matches!(
            field.and_then(|v| compare(v, operand)),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => field.and_then(|v| compare(v, operand)) == Some(Ordering::Less),
        "$lte" => matches!(
            field.and_then(|v| compare(v, operand)),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => match (field, operand) {
            (Some(v), Bson::Array(items)) => items.iter().any(|item| equals(v, item)),
            _ => false,
        },
        "$exists" => {
            let wanted = !matches!(operand, Bson::Boolean(false) | Bson::Int32(0));
            field.is_some() == wanted
        }
        _ => false,
    })
}

fn matches_filter(doc: &BsonDocument, filter: &BsonDocument) -> bool {
    filter
        .iter()
        .all(|(field, condition)| matches_condition(doc.get(field), condition))
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        other => as_f64(other).map(|n| n != 0.0).unwrap_or(true),
    }
}

fn project(doc: &BsonDocument, projection: &BsonDocument) -> BsonDocument {
    let inclusive = projection
        .iter()
        .any(|(field, flag)| field != "_id" && truthy(flag));
    let keep_id = projection.get("_id").map(truthy).unwrap_or(true);

    let mut out = BsonDocument::new();
    for (field, value) in doc {
        let keep = if field == "_id" {
            keep_id
        } else if inclusive {
            projection.get(field).map(truthy).unwrap_or(false)
        } else {
            projection.get(field).map(truthy).unwrap_or(true)
        };
        if keep {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

fn apply_operators(target: &mut BsonDocument, update: &BsonDocument) -> Result<()> {
    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(BridgeError::driver(
                ErrorCode::WriteError,
                format!("Modifiers operate on fields but we found another type instead for {}", op),
            ));
        };
        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    target.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    target.remove(field);
                }
                "$inc" => {
                    let current = target.get(field).cloned().unwrap_or(Bson::Int32(0));
                    let sum = match (&current, value) {
                        (Bson::Int32(a), Bson::Int32(b)) => Bson::Int32(a.wrapping_add(*b)),
                        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a.wrapping_add(*b)),
                        _ => match (as_f64(&current), as_f64(value)) {
                            (Some(a), Some(b)) => Bson::Double(a + b),
                            _ => {
                                return Err(BridgeError::driver(
                                    ErrorCode::WriteError,
                                    format!("Cannot apply $inc to a value of non-numeric type: {}", field),
                                ))
                            }
                        },
                    };
                    target.insert(field.clone(), sum);
                }
                other => {
                    return Err(BridgeError::driver(
                        ErrorCode::WriteError,
                        format!("Unknown modifier: {}", other),
                    ))
                }
            }
        }
    }
    Ok(())
}

/// Seed document for an upsert: the filter's plain equality fields
fn upsert_seed(filter: &BsonDocument) -> BsonDocument {
    let mut seed = BsonDocument::new();
    for (field, value) in filter {
        if !field.starts_with('$') && is_operator_doc(value).is_none() {
            seed.insert(field.clone(), value.clone());
        }
    }
    seed
}

fn with_id_first(doc: BsonDocument) -> BsonDocument {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = doc! { "_id": bson::oid::ObjectId::new() };
    out.extend(doc);
    out
}

impl Store {
    fn insert(&mut self, namespace: &str, doc: BsonDocument) -> Result<()> {
        let doc = with_id_first(doc);
        let collection = self.collections.entry(namespace.to_string()).or_default();
        if let Some(id) = doc.get("_id") {
            if collection.iter().any(|existing| existing.get("_id") == Some(id)) {
                return Err(duplicate_key(namespace, id));
            }
        }
        collection.push(doc);
        Ok(())
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&mut self, address: &str, port: u16) -> Result<()> {
        if address.is_empty() || port == 0 {
            return Err(BridgeError::driver(ErrorCode::ConnFail, ""));
        }
        debug!(address, port, "Memory driver connected");
        self.connected = true;
        Ok(())
    }

    async fn find(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        spec: FindSpec,
    ) -> Result<Box<dyn DriverCursor>> {
        self.ensure_connected()?;
        split_namespace(namespace)?;

        let store = self.store.lock();
        let skip = usize::try_from(spec.skip).unwrap_or(0);
        let limit = match spec.limit {
            0 => usize::MAX,
            n => n.unsigned_abs() as usize,
        };

        let mut pending = VecDeque::new();
        let matched = store
            .collections
            .get(namespace)
            .into_iter()
            .flatten()
            .filter(|doc| matches_filter(doc, &filter))
            .skip(skip)
            .take(limit);
        for doc in matched {
            let shaped = match &spec.projection {
                Some(projection) if !projection.is_empty() => project(doc, projection),
                _ => doc.clone(),
            };
            pending.push_back(to_raw(&shaped)?);
        }
        Ok(Box::new(MemoryCursor { pending }))
    }

    async fn insert(&mut self, namespace: &str, doc: BsonDocument) -> Result<()> {
        self.ensure_connected()?;
        split_namespace(namespace)?;
        self.store.lock().insert(namespace, doc)
    }

    async fn insert_batch(&mut self, namespace: &str, docs: Vec<BsonDocument>, flags: u32) -> Result<()> {
        self.ensure_connected()?;
        split_namespace(namespace)?;

        let continue_on_error = flags & MONGO_CONTINUE_ON_ERROR != 0;
        let mut store = self.store.lock();
        let mut first_error = None;
        for doc in docs {
            if let Err(err) = store.insert(namespace, doc) {
                if !continue_on_error {
                    return Err(err);
                }
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn update(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        update: BsonDocument,
        flags: u32,
    ) -> Result<()> {
        self.ensure_connected()?;
        split_namespace(namespace)?;

        let operator = is_operator_update(&update);
        let multi = operator && flags & MONGO_UPDATE_MULTI != 0;
        let mut store = self.store.lock();
        let collection = store.collections.entry(namespace.to_string()).or_default();

        let mut matched = 0;
        for doc in collection.iter_mut().filter(|doc| matches_filter(doc, &filter)) {
            if operator {
                apply_operators(doc, &update)?;
            } else {
                let id = doc.get("_id").cloned();
                let mut replacement = update.clone();
                replacement.remove("_id");
                *doc = match id {
                    Some(id) => {
                        let mut with_id = doc! { "_id": id };
                        with_id.extend(replacement);
                        with_id
                    }
                    None => replacement,
                };
            }
            matched += 1;
            if !multi {
                break;
            }
        }

        if matched == 0 && flags & MONGO_UPDATE_UPSERT != 0 {
            let created = if operator {
                let mut seed = upsert_seed(&filter);
                apply_operators(&mut seed, &update)?;
                seed
            } else {
                update
            };
            store.insert(namespace, created)?;
        }
        Ok(())
    }

    async fn remove(&mut self, namespace: &str, filter: BsonDocument) -> Result<()> {
        self.ensure_connected()?;
        split_namespace(namespace)?;
        if let Some(collection) = self.store.lock().collections.get_mut(namespace) {
            collection.retain(|doc| !matches_filter(doc, &filter));
        }
        Ok(())
    }

    async fn command(&mut self, database: &str, command: BsonDocument) -> Result<BsonDocument> {
        self.ensure_connected()?;
        let database = database_of(database);
        let Some((name, argument)) = command.iter().next() else {
            return Err(BridgeError::driver(ErrorCode::CommandFailed, "no command specified"));
        };

        let mut store = self.store.lock();
        match name.as_str() {
            "ping" | "buildInfo" | "isMaster" | "hello" => Ok(doc! { "ok": 1.0 }),
            "count" => {
                let namespace = format!("{}.{}", database, argument.as_str().unwrap_or_default());
                let query = command.get_document("query").cloned().unwrap_or_default();
                let n = store
                    .collections
                    .get(&namespace)
                    .map(|docs| docs.iter().filter(|doc| matches_filter(doc, &query)).count())
                    .unwrap_or(0) as i32;
                Ok(doc! { "n": n, "ok": 1.0 })
            }
            "drop" => {
                let namespace = format!("{}.{}", database, argument.as_str().unwrap_or_default());
                match store.collections.remove(&namespace) {
                    Some(_) => {
                        store.indexes.remove(&namespace);
                        Ok(doc! { "ns": namespace, "ok": 1.0 })
                    }
                    None => Err(BridgeError::driver(ErrorCode::CommandFailed, "ns not found")),
                }
            }
            other => Err(BridgeError::driver(
                ErrorCode::CommandFailed,
                format!("no such command: '{}'", other),
            )),
        }
    }

    async fn create_index(&mut self, namespace: &str, index: IndexSpec) -> Result<BsonDocument> {
        self.ensure_connected()?;
        split_namespace(namespace)?;

        let name = index.resolved_name();
        let mut store = self.store.lock();
        let created_collection = !store.collections.contains_key(namespace);
        store.collections.entry(namespace.to_string()).or_default();

        let names = store.indexes.entry(namespace.to_string()).or_insert_with(|| vec!["_id_".to_string()]);
        let before = names.len() as i32;
        if !names.contains(&name) {
            names.push(name);
        }
        let after = names.len() as i32;

        Ok(doc! {
            "createdCollectionAutomatically": created_collection,
            "numIndexesBefore": before,
            "numIndexesAfter": after,
            "ok": 1.0,
        })
    }

    async fn destroy(&mut self) {
        self.connected = false;
    }
}
