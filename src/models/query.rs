//! Query parameter model.
//!
//! [`QueryParam`] is what crosses the driver boundary: every value bound to a
//! `$n` placeholder is one of these.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Decimal(Decimal),
    /// Structured JSON handed to the driver's native adapter.
    Json(JsonValue),
    /// JSON already encoded to text by the toolkit's codec.
    JsonText(String),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    BoolArray(Vec<bool>),
    UuidArray(Vec<Uuid>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Decimal(_) => "decimal",
            Self::Json(_) => "json",
            Self::JsonText(_) => "json_text",
            Self::TextArray(_) => "text[]",
            Self::IntArray(_) => "int[]",
            Self::FloatArray(_) => "float[]",
            Self::BoolArray(_) => "bool[]",
            Self::UuidArray(_) => "uuid[]",
        }
    }

    /// Short rendering used when a key appears in an error message.
    pub fn display_key(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => v.clone(),
            Self::Uuid(v) => v.to_string(),
            Self::Timestamp(v) => v.to_rfc3339(),
            Self::Date(v) => v.to_string(),
            Self::Decimal(v) => v.to_string(),
            other => format!("<{}>", other.type_name()),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Uuid> for QueryParam {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(QueryParam::Null.type_name(), "null");
        assert_eq!(QueryParam::JsonText("{}".into()).type_name(), "json_text");
        assert_eq!(QueryParam::TextArray(vec![]).type_name(), "text[]");
    }

    #[test]
    fn test_display_key() {
        let id = Uuid::nil();
        assert_eq!(
            QueryParam::from(id).display_key(),
            "00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(QueryParam::from(42).display_key(), "42");
        assert_eq!(QueryParam::Bytes(vec![1]).display_key(), "<bytes>");
    }
}
