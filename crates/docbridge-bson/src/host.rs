//! Host boundary: `serde_json` values in, `serde_json` values out.

use serde_json::{Map, Number, Value as JsonValue};

use crate::value::{Document, Value};

/// Infer a model value from a host value.
///
/// Numbers become `Int32` when they hold an integral value that fits a
/// signed 32-bit integer (`2.0` included), otherwise `Double`.
pub fn from_host(value: &JsonValue) -> Value {
    match value {
        JsonValue::Array(items) => Value::Array(items.iter().map(from_host).collect()),
        JsonValue::Object(map) => Value::Document(document_from_map(map)),
        JsonValue::Number(n) => number_from_host(n),
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Null => Value::Null,
    }
}

/// Convert a host object; `None` for anything that is not an object
pub fn document_from_host(value: &JsonValue) -> Option<Document> {
    value.as_object().map(document_from_map)
}

fn document_from_map(map: &Map<String, JsonValue>) -> Document {
    let mut doc = Document::with_capacity(map.len());
    for (key, value) in map {
        doc.insert(key.as_str(), from_host(value));
    }
    doc
}

fn number_from_host(n: &Number) -> Value {
    if let Some(Ok(small)) = n.as_i64().map(i32::try_from) {
        return Value::Int32(small);
    }
    let f = n.as_f64().unwrap_or(f64::NAN);
    if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
        Value::Int32(f as i32)
    } else {
        Value::Double(f)
    }
}

/// Convert a model value to a host value
pub fn to_host(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int32(n) => JsonValue::from(*n),
        Value::Int64(n) => JsonValue::from(*n),
        Value::Double(n) => Number::from_f64(*n).map_or(JsonValue::Null, JsonValue::Number),
        Value::String(s) | Value::Unrecognized(s) => JsonValue::String(s.clone()),
        Value::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Value::Timestamp(ms) => JsonValue::from(*ms),
        Value::Array(items) => JsonValue::Array(items.iter().map(to_host).collect()),
        Value::Document(doc) => JsonValue::Object(document_to_map(doc)),
    }
}

pub fn document_to_host(doc: &Document) -> JsonValue {
    JsonValue::Object(document_to_map(doc))
}

fn document_to_map(doc: &Document) -> Map<String, JsonValue> {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        map.insert(key.to_string(), to_host(value));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_inference() {
        assert_eq!(from_host(&json!(7)), Value::Int32(7));
        assert_eq!(from_host(&json!(-7)), Value::Int32(-7));
        assert_eq!(from_host(&json!(2147483647)), Value::Int32(i32::MAX));
        assert_eq!(from_host(&json!(-2147483648)), Value::Int32(i32::MIN));
        assert_eq!(from_host(&json!(3000000000u64)), Value::Double(3_000_000_000.0));
        assert_eq!(from_host(&json!(1.5)), Value::Double(1.5));
    }

    #[test]
    fn test_integral_floats_become_int32() {
        assert_eq!(from_host(&json!(1.0)), Value::Int32(1));
        assert_eq!(from_host(&serde_json::from_str("2.0").unwrap()), Value::Int32(2));
        assert_eq!(from_host(&json!(-2147483648.0)), Value::Int32(i32::MIN));
        assert_eq!(from_host(&json!(2147483648.0)), Value::Double(2_147_483_648.0));
        assert_eq!(from_host(&json!(1e300)), Value::Double(1e300));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(from_host(&json!("hi")), Value::from("hi"));
        assert_eq!(from_host(&json!(true)), Value::Bool(true));
        assert_eq!(from_host(&json!(null)), Value::Null);
    }

    #[test]
    fn test_object_order_is_preserved() {
        let doc = document_from_host(&json!({"z": 1, "a": [1, "x"], "m": {}})).unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(doc.get("a"), Some(&Value::Array(vec![Value::Int32(1), Value::from("x")])));
        assert_eq!(doc.get("m"), Some(&Value::Document(Document::new())));
    }

    #[test]
    fn test_document_from_non_object() {
        assert!(document_from_host(&json!([1, 2])).is_none());
        assert!(document_from_host(&json!("x")).is_none());
    }

    #[test]
    fn test_to_host() {
        let mut doc = Document::new();
        doc.insert("when", Value::Timestamp(1_000));
        doc.insert("n", Value::Double(2.5));
        doc.insert("nan", Value::Double(f64::NAN));
        doc.insert("list", vec![Value::from(1), Value::Null]);
        assert_eq!(
            document_to_host(&doc),
            json!({"when": 1000, "n": 2.5, "nan": null, "list": [1, null]})
        );
    }

    #[test]
    fn test_object_id_to_host() {
        let oid = bson::oid::ObjectId::new();
        assert_eq!(to_host(&Value::ObjectId(oid)), json!(oid.to_hex()));
    }
}
