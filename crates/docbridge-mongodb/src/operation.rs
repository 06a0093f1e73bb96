//! Operation dispatch table.
//!
//! Each operation has three phases:
//! 1. [`build`]: positional arguments are validated and request documents
//!    encoded into a fresh [`Baton`]. Argument problems are faults.
//! 2. [`execute`]: the single driver call, run inline or on a worker.
//! 3. [`shape`]: driver output is decoded into the result structure.

use bson::Document as BsonDocument;
use docbridge_bson::{decode_raw, host, object_id, DocHandle, Document, Encoder, IdBinding, Scope};
use docbridge_common::{BridgeError, ErrorCode, Result};
use serde_json::{json, Map, Value as JsonValue};
use tracing::warn;

use crate::baton::Baton;
use crate::driver::{database_of, Driver, FindSpec, IndexSpec};
use crate::options::{parse_options, OptionKind, MONGO_UPDATE_BASIC};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every operation the bridge exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    About,
    Version,
    Open,
    Close,
    Retrieve,
    Insert,
    InsertBatch,
    Update,
    Remove,
    Command,
    CreateIndex,
    ObjectId,
    ObjectIdDate,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::About => "about",
            OpKind::Version => "version",
            OpKind::Open => "open",
            OpKind::Close => "close",
            OpKind::Retrieve => "retrieve",
            OpKind::Insert => "insert",
            OpKind::InsertBatch => "insert_batch",
            OpKind::Update => "update",
            OpKind::Remove => "remove",
            OpKind::Command => "command",
            OpKind::CreateIndex => "create_index",
            OpKind::ObjectId => "object_id",
            OpKind::ObjectIdDate => "object_id_date",
        }
    }

    /// Resolve a method name; `find` is accepted for `retrieve`
    pub fn from_name(name: &str) -> Option<OpKind> {
        let kind = match name {
            "about" => OpKind::About,
            "version" => OpKind::Version,
            "open" => OpKind::Open,
            "close" => OpKind::Close,
            "retrieve" | "find" => OpKind::Retrieve,
            "insert" => OpKind::Insert,
            "insert_batch" => OpKind::InsertBatch,
            "update" => OpKind::Update,
            "remove" => OpKind::Remove,
            "command" => OpKind::Command,
            "create_index" => OpKind::CreateIndex,
            "object_id" => OpKind::ObjectId,
            "object_id_date" => OpKind::ObjectIdDate,
            _ => return None,
        };
        Some(kind)
    }

    /// Name used in argument error messages
    fn method(&self) -> &'static str {
        match self {
            OpKind::Retrieve => "Retrieve",
            OpKind::Insert => "Insert",
            OpKind::InsertBatch => "Insert Batch",
            OpKind::Update => "Update",
            OpKind::Remove => "Remove",
            OpKind::Command => "Command",
            OpKind::CreateIndex => "Create_Index",
            _ => "Unknown",
        }
    }

    /// Whether the connection must be open before the call is accepted
    pub fn requires_connection(&self) -> bool {
        matches!(
            self,
            OpKind::Retrieve
                | OpKind::Insert
                | OpKind::InsertBatch
                | OpKind::Update
                | OpKind::Remove
                | OpKind::Command
                | OpKind::CreateIndex
        )
    }

    /// Whether the operation calls the driver at all
    pub fn uses_driver(&self) -> bool {
        self.requires_connection() || matches!(self, OpKind::Open | OpKind::Close)
    }

    /// Operations whose synchronous form returns a bare string
    pub fn returns_text(&self) -> bool {
        matches!(self, OpKind::About | OpKind::Version | OpKind::ObjectId)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings shared by every baton built for a connection
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub id_field: String,
    pub encoder: Encoder,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            id_field: docbridge_bson::DEFAULT_ID_FIELD.to_string(),
            encoder: Encoder::default(),
        }
    }
}

/// Validate arguments and encode request documents.
///
/// Argument and option errors are returned as faults. Encoding failures
/// (such as an oversized document) are recorded on the baton instead, so
/// they surface through the failure result.
pub fn build(kind: OpKind, args: &[JsonValue], ctx: &BuildContext) -> Result<Baton> {
    let mut baton = Baton::new(kind, &ctx.id_field, ctx.encoder.clone());

    let parsed = match kind {
        OpKind::About => {
            baton.output = format!("docbridge: Version: {}", VERSION);
            Ok(())
        }
        OpKind::Version => {
            baton.output = VERSION.to_string();
            Ok(())
        }
        OpKind::ObjectId => {
            baton.output = object_id::generate().to_hex();
            Ok(())
        }
        OpKind::ObjectIdDate => build_object_id_date(&mut baton, args),
        OpKind::Open => build_open(&mut baton, args),
        OpKind::Close => Ok(()),
        OpKind::Retrieve => build_retrieve(&mut baton, args),
        OpKind::Insert => build_insert(&mut baton, args),
        OpKind::InsertBatch => build_insert_batch(&mut baton, args),
        OpKind::Update => build_update(&mut baton, args),
        OpKind::Remove => build_remove(&mut baton, args),
        OpKind::Command => build_command(&mut baton, args),
        OpKind::CreateIndex => build_create_index(&mut baton, args),
    };

    match parsed {
        Ok(()) => Ok(baton),
        Err(err) if err.is_fault() => Err(err),
        Err(err) => {
            baton.fail(err);
            Ok(baton)
        }
    }
}

fn take_namespace(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    match args.first().and_then(JsonValue::as_str) {
        Some(ns) if !ns.is_empty() => {
            baton.namespace = ns.to_string();
            Ok(())
        }
        _ => Err(BridgeError::Argument(format!(
            "Mongo Namespace not specified for {} Method",
            baton.kind.method()
        ))),
    }
}

/// Accept an identifier-field override at `pos`; returns the next position
fn take_id_override(baton: &mut Baton, args: &[JsonValue], pos: usize) -> usize {
    match args.get(pos) {
        Some(JsonValue::String(name)) => {
            if !name.is_empty() {
                baton.id_field = name.clone();
            }
            pos + 1
        }
        _ => pos,
    }
}

fn object_at(args: &[JsonValue], pos: usize) -> Option<Document> {
    args.get(pos).and_then(host::document_from_host)
}

fn string_at(args: &[JsonValue], pos: usize) -> Option<&str> {
    args.get(pos).and_then(JsonValue::as_str)
}

fn int_at(args: &[JsonValue], pos: usize) -> Option<i32> {
    args.get(pos).and_then(JsonValue::as_f64).map(|n| n as i32)
}

fn missing(what: &str, kind: OpKind) -> BridgeError {
    BridgeError::Argument(format!("Mongo {} not specified for {} Method", what, kind.method()))
}

/// Encode a document with its own identifier binding and store it
fn encode(baton: &mut Baton, doc: &Document, scope: Scope) -> Result<(DocHandle, IdBinding)> {
    let mut binding = IdBinding::new(baton.id_field.clone());
    let encoded = baton.encoder.encode_document(doc, &mut binding, scope);
    let handle = baton.store(&encoded)?;
    Ok((handle, binding))
}

fn build_open(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    let config = args.first().and_then(JsonValue::as_object);

    let address = config
        .and_then(|c| c.get("address"))
        .and_then(JsonValue::as_str)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| BridgeError::Argument("No IP address specified for Mongo Server".to_string()))?;

    let port = config
        .and_then(|c| c.get("port"))
        .and_then(|p| match p {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| BridgeError::Argument("No TCP Port specified for Mongo Server".to_string()))?;

    baton.target = Some((address.to_string(), port));
    Ok(())
}

fn build_object_id_date(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    let text = string_at(args, 0)
        .ok_or_else(|| BridgeError::Argument("Mongo ObjectID not specified".to_string()))?;
    match object_id::validate(text) {
        Ok(oid) => {
            baton.output = object_id::date_text(&oid);
            Ok(())
        }
        Err(err) => Err(BridgeError::driver(ErrorCode::Other(-1), err.to_string())),
    }
}

fn build_retrieve(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    if let Some(text) = string_at(args, pos + 4) {
        baton.options = parse_options(OptionKind::Retrieve, text)?;
    }
    baton.limit = int_at(args, pos + 2).unwrap_or(0);
    baton.skip = int_at(args, pos + 3).unwrap_or(0);

    // Omitted reference matches everything
    let reference = object_at(args, pos).unwrap_or_default();
    let (handle, binding) = encode(baton, &reference, Scope::Query)?;
    baton.reference = Some(handle);
    baton.bindings.push(binding);

    if let Some(projection) = object_at(args, pos + 1) {
        let (handle, _) = encode(baton, &projection, Scope::Query)?;
        baton.projection = Some(handle);
    }
    Ok(())
}

fn build_insert(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let doc = object_at(args, pos).ok_or_else(|| missing("Object", baton.kind))?;
    if let Some(text) = string_at(args, pos + 1) {
        baton.options = parse_options(OptionKind::Insert, text)?;
    }

    let (handle, binding) = encode(baton, &doc, Scope::Create)?;
    baton.main = Some(handle);
    baton.bindings.push(binding);
    Ok(())
}

fn build_insert_batch(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let records = args
        .get(pos)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| missing("Object Array", baton.kind))?;
    if records.is_empty() {
        return Err(BridgeError::Argument(
            "Mongo Object Array supplied for Insert Batch Method is empty".to_string(),
        ));
    }
    let mut docs = Vec::with_capacity(records.len());
    for (n, record) in records.iter().enumerate() {
        let doc = host::document_from_host(record).ok_or_else(|| {
            BridgeError::Argument(format!(
                "Mongo Object Array supplied for Insert Batch Method has a bad record at position {}",
                n
            ))
        })?;
        docs.push(doc);
    }
    if let Some(text) = string_at(args, pos + 1) {
        baton.options = parse_options(OptionKind::Insert, text)?;
    }

    for doc in &docs {
        let (handle, binding) = encode(baton, doc, Scope::Create)?;
        baton.batch.push(handle);
        baton.bindings.push(binding);
    }
    Ok(())
}

fn build_update(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let reference = object_at(args, pos).ok_or_else(|| missing("Reference Object", baton.kind))?;
    let replacement = object_at(args, pos + 1).ok_or_else(|| missing("Object", baton.kind))?;
    baton.options = match string_at(args, pos + 2) {
        Some(text) => parse_options(OptionKind::Update, text)?,
        None => MONGO_UPDATE_BASIC,
    };

    let (handle, binding) = encode(baton, &reference, Scope::Query)?;
    baton.reference = Some(handle);
    baton.bindings.push(binding);
    let (handle, _) = encode(baton, &replacement, Scope::Query)?;
    baton.main = Some(handle);
    Ok(())
}

fn build_remove(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let reference = object_at(args, pos).ok_or_else(|| missing("Reference Object", baton.kind))?;
    let (handle, binding) = encode(baton, &reference, Scope::Query)?;
    baton.reference = Some(handle);
    baton.bindings.push(binding);
    Ok(())
}

fn build_command(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let command = object_at(args, pos).ok_or_else(|| missing("Command Object", baton.kind))?;
    let (handle, binding) = encode(baton, &command, Scope::Query)?;
    baton.main = Some(handle);
    baton.bindings.push(binding);
    Ok(())
}

fn build_create_index(baton: &mut Baton, args: &[JsonValue]) -> Result<()> {
    take_namespace(baton, args)?;
    let pos = take_id_override(baton, args, 1);

    let keys = object_at(args, pos).ok_or_else(|| missing("Index Object", baton.kind))?;
    baton.index_name = string_at(args, pos + 1).map(str::to_string);
    if let Some(text) = string_at(args, pos + 2) {
        baton.options = parse_options(OptionKind::CreateIndex, text)?;
    }

    let (handle, binding) = encode(baton, &keys, Scope::Query)?;
    baton.main = Some(handle);
    baton.bindings.push(binding);
    Ok(())
}

/// Run the driver call for a built baton. Failures are recorded on the
/// baton; nothing runs when building already failed.
pub async fn execute(baton: &mut Baton, driver: &mut dyn Driver) {
    if baton.error.is_some() || !baton.kind.uses_driver() {
        return;
    }
    if let Err(err) = dispatch(baton, driver).await {
        warn!(
            op = baton.kind.name(),
            namespace = %baton.namespace,
            code = err.error_code(),
            error = %err,
            "Driver returned an error"
        );
        baton.fail(err);
    }
}

fn required(handle: Option<DocHandle>) -> Result<DocHandle> {
    handle.ok_or(BridgeError::Unprocessable)
}

async fn dispatch(baton: &mut Baton, driver: &mut dyn Driver) -> Result<()> {
    match baton.kind {
        OpKind::Open => {
            let (address, port) = baton.target.clone().ok_or(BridgeError::Unprocessable)?;
            driver.connect(&address, port).await
        }
        OpKind::Close => {
            driver.destroy().await;
            Ok(())
        }
        OpKind::Retrieve => {
            let filter = baton.load(required(baton.reference)?)?;
            let spec = FindSpec {
                projection: baton.load_optional(baton.projection)?,
                limit: baton.limit,
                skip: baton.skip,
                flags: baton.options,
            };
            let mut cursor = driver.find(&baton.namespace, filter, spec).await?;
            while let Some(raw) = cursor.next().await? {
                let handle = baton.arena.push(raw);
                baton.results.push(handle);
            }
            Ok(())
        }
        OpKind::Insert => {
            let doc = baton.load(required(baton.main)?)?;
            driver.insert(&baton.namespace, doc).await
        }
        OpKind::InsertBatch => {
            let docs = baton
                .batch
                .iter()
                .map(|h| baton.load(*h))
                .collect::<Result<Vec<BsonDocument>>>()?;
            driver.insert_batch(&baton.namespace, docs, baton.options).await
        }
        OpKind::Update => {
            let filter = baton.load(required(baton.reference)?)?;
            let update = baton.load(required(baton.main)?)?;
            driver.update(&baton.namespace, filter, update, baton.options).await
        }
        OpKind::Remove => {
            let filter = baton.load(required(baton.reference)?)?;
            driver.remove(&baton.namespace, filter).await
        }
        OpKind::Command => {
            let command = baton.load(required(baton.main)?)?;
            let response = driver.command(database_of(&baton.namespace), command).await?;
            baton.response = Some(baton.store(&response)?);
            Ok(())
        }
        OpKind::CreateIndex => {
            let index = IndexSpec {
                keys: baton.load(required(baton.main)?)?,
                name: baton.index_name.clone(),
                flags: baton.options,
            };
            let response = driver.create_index(&baton.namespace, index).await?;
            baton.response = Some(baton.store(&response)?);
            Ok(())
        }
        OpKind::About | OpKind::Version | OpKind::ObjectId | OpKind::ObjectIdDate => Ok(()),
    }
}

/// Failure result structure
pub fn failure_value(message: &str, code: i32) -> JsonValue {
    json!({
        "ok": false,
        "ErrorMessage": message,
        "ErrorCode": code,
    })
}

/// Shape the result of a finished baton. Returns `(error, result)`.
pub fn shape(baton: &Baton) -> (bool, JsonValue) {
    if let Some(err) = &baton.error {
        return (true, failure_value(&err.to_string(), err.error_code()));
    }
    match shape_success(baton) {
        Ok(value) => (false, value),
        Err(err) => (true, failure_value(&err.to_string(), err.error_code())),
    }
}

fn decode_handle(baton: &Baton, handle: DocHandle) -> Result<JsonValue> {
    let raw = baton
        .arena
        .get(handle)
        .ok_or_else(|| BridgeError::format(ErrorCode::BsonNotFinished, ""))?;
    Ok(host::document_to_host(&decode_raw(raw)?))
}

fn id_entry(field: &str, binding: &IdBinding) -> (String, JsonValue) {
    let text = binding.text().unwrap_or_default();
    (field.to_string(), JsonValue::String(text))
}

fn shape_success(baton: &Baton) -> Result<JsonValue> {
    let mut out = Map::new();
    out.insert("ok".to_string(), JsonValue::Bool(true));

    match baton.kind {
        OpKind::Retrieve => {
            let data = baton
                .results
                .iter()
                .map(|h| decode_handle(baton, *h))
                .collect::<Result<Vec<_>>>()?;
            out.insert("data".to_string(), JsonValue::Array(data));
        }
        OpKind::Command | OpKind::CreateIndex => {
            let data = match baton.response {
                Some(h) => decode_handle(baton, h)?,
                None => JsonValue::Object(Map::new()),
            };
            out.insert("data".to_string(), data);
        }
        OpKind::Insert => {
            out.insert("result".to_string(), json!(0));
            if let Some(binding) = baton.bindings.first() {
                let (key, value) = id_entry(&baton.id_field, binding);
                out.insert(key, value);
            }
        }
        OpKind::InsertBatch => {
            out.insert("result".to_string(), json!(0));
            let data = baton
                .bindings
                .iter()
                .map(|binding| {
                    let (key, value) = id_entry(&baton.id_field, binding);
                    let mut entry = Map::new();
                    entry.insert(key, value);
                    JsonValue::Object(entry)
                })
                .collect();
            out.insert("data".to_string(), JsonValue::Array(data));
        }
        OpKind::Update | OpKind::Remove | OpKind::Open | OpKind::Close => {
            out.insert("result".to_string(), json!(0));
        }
        OpKind::About | OpKind::Version | OpKind::ObjectId => {
            out.insert("result".to_string(), JsonValue::String(baton.output.clone()));
        }
        OpKind::ObjectIdDate => {
            out.insert("result".to_string(), json!(0));
            out.insert("DateText".to_string(), JsonValue::String(baton.output.clone()));
        }
    }
    Ok(JsonValue::Object(out))
}
