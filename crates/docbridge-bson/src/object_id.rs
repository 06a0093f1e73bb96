//! ObjectId helpers: generation, strict validation and timestamp text.

use bson::oid::ObjectId;
use chrono::{DateTime, Local, TimeZone, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Invalid ObjectId ({0})")]
    Invalid(String),
}

/// Generate a fresh, time-ordered identifier
pub fn generate() -> ObjectId {
    ObjectId::new()
}

/// Validate identifier text.
///
/// The text must be exactly 24 characters and must re-stringify to itself,
/// so uppercase hex is rejected even though it parses.
pub fn validate(text: &str) -> Result<ObjectId, IdentifierError> {
    if text.len() != 24 {
        return Err(IdentifierError::Invalid(text.to_string()));
    }
    let oid = ObjectId::parse_str(text).map_err(|_| IdentifierError::Invalid(text.to_string()))?;
    if oid.to_hex() != text {
        return Err(IdentifierError::Invalid(text.to_string()));
    }
    Ok(oid)
}

/// Creation time stored in the leading four bytes
pub fn extract_timestamp(oid: &ObjectId) -> DateTime<Utc> {
    let bytes = oid.bytes();
    let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or_default()
}

/// Creation time in `ctime` layout, local time, e.g. `Thu Nov 28 10:15:03 2013`
pub fn date_text(oid: &ObjectId) -> String {
    extract_timestamp(oid)
        .with_timezone(&Local)
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
}
