//! JSON text encoding and decoding for document fields.
//!
//! Canonical forms for values JSON has no type for:
//!
//! | value     | JSON                                           |
//! |-----------|------------------------------------------------|
//! | uuid      | hyphenated lowercase string                    |
//! | timestamp | RFC 3339 string in UTC (`Z` suffix)            |
//! | date      | `YYYY-MM-DD` string                            |
//! | decimal   | exact decimal string, scale preserved          |
//! | set       | array, deduplicated, sorted by encoded text    |
//! | bytes     | standard base64 string                         |

use crate::error::{DbError, DbResult};
use crate::models::FieldValue;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::SecondsFormat;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Stateless JSON codec. Every error names the field it failed on.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Convert a value graph to JSON, substituting canonical forms.
    pub fn to_json(field: &str, value: &FieldValue) -> DbResult<JsonValue> {
        Ok(match value {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Bool(b) => JsonValue::Bool(*b),
            FieldValue::Int(i) => JsonValue::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .ok_or_else(|| {
                    DbError::serialization(field, format!("{} is not representable in JSON", f))
                })?,
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Bytes(b) => JsonValue::String(STANDARD.encode(b)),
            FieldValue::Uuid(u) => JsonValue::String(u.hyphenated().to_string()),
            FieldValue::Timestamp(ts) => {
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            FieldValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Decimal(d) => JsonValue::String(d.to_string()),
            FieldValue::List(items) => JsonValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| Self::to_json(&format!("{}[{}]", field, i), item))
                    .collect::<DbResult<_>>()?,
            ),
            FieldValue::Set(items) => Self::canonical_set(field, items)?,
            FieldValue::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Self::to_json(&format!("{}.{}", field, k), v)?)))
                    .collect::<DbResult<_>>()?,
            ),
            FieldValue::Json(v) => v.clone(),
            FieldValue::Opaque(type_name) => {
                return Err(DbError::serialization(
                    field,
                    format!("value of type {} has no JSON representation", type_name),
                ));
            }
        })
    }

    fn canonical_set(field: &str, items: &[FieldValue]) -> DbResult<JsonValue> {
        let mut encoded = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let json = Self::to_json(&format!("{}[{}]", field, i), item)?;
                Ok((json.to_string(), json))
            })
            .collect::<DbResult<Vec<_>>>()?;
        encoded.sort_by(|a, b| a.0.cmp(&b.0));
        encoded.dedup_by(|a, b| a.0 == b.0);
        Ok(JsonValue::Array(encoded.into_iter().map(|(_, v)| v).collect()))
    }

    /// Encode a value graph to JSON text.
    pub fn encode(field: &str, value: &FieldValue) -> DbResult<String> {
        Ok(Self::to_json(field, value)?.to_string())
    }

    /// Encode any serde value to JSON text.
    pub fn encode_serialize<T: Serialize + ?Sized>(field: &str, value: &T) -> DbResult<String> {
        serde_json::to_string(value).map_err(|e| DbError::serialization(field, e.to_string()))
    }

    /// Parse JSON text. Empty or malformed input is a `Deserialization` error.
    pub fn decode(field: &str, raw: &str) -> DbResult<JsonValue> {
        if raw.trim().is_empty() {
            return Err(DbError::deserialization(field, raw, "empty input"));
        }
        serde_json::from_str(raw).map_err(|e| DbError::deserialization(field, raw, e.to_string()))
    }

    /// [`decode`](Self::decode) for raw bytes; invalid UTF-8 is rejected.
    pub fn decode_bytes(field: &str, raw: &[u8]) -> DbResult<JsonValue> {
        match std::str::from_utf8(raw) {
            Ok(text) => Self::decode(field, text),
            Err(e) => Err(DbError::deserialization(
                field,
                &String::from_utf8_lossy(raw),
                format!("invalid UTF-8: {}", e),
            )),
        }
    }

    /// Parse JSON text straight into `T`. Nothing is returned unless the
    /// whole document fits.
    pub fn decode_as<T: DeserializeOwned>(field: &str, raw: &str) -> DbResult<T> {
        if raw.trim().is_empty() {
            return Err(DbError::deserialization(field, raw, "empty input"));
        }
        serde_json::from_str(raw).map_err(|e| DbError::deserialization(field, raw, e.to_string()))
    }
}
