//! Document model and BSON codec for docbridge
//!
//! The codec works over a closed [`Value`] tree; host adaptation lives in
//! [`host`], identifier helpers in [`object_id`] and the per-task document
//! arena in [`arena`].

pub mod arena;
pub mod codec;
pub mod host;
pub mod object_id;
pub mod value;

pub use arena::{DocHandle, DocumentArena};
pub use codec::{decode_array, decode_document, decode_raw, Encoder, IdBinding, Scope, MAX_DOCUMENT_SIZE};
pub use object_id::IdentifierError;
pub use value::{Document, Value};

/// Identifier field used when the caller supplies no override
pub const DEFAULT_ID_FIELD: &str = "_id";
