//! The value graph walked by the JSON codec.
//!
//! Record fields are carried as [`FieldValue`] between the caller and the
//! repository. Unlike `serde_json::Value` it keeps the types JSON has no
//! native representation for (uuids, timestamps, dates, decimals, sets and
//! byte strings) so the codec can substitute a canonical form for each.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Decimal(Decimal),
    List(Vec<FieldValue>),
    /// Unordered collection; the codec picks a canonical order and drops duplicates.
    Set(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
    /// Already-structured JSON, passed through unchanged.
    Json(JsonValue),
    /// A value with no JSON representation, named by its type.
    Opaque(String),
}

/// Field name to value, as used by `Repository::update`.
pub type FieldMap = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null) || matches!(self, Self::Json(JsonValue::Null))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Decimal(_) => "decimal",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Json(_) => "json",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Lift a plain JSON value into the graph, keeping its shape.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            // Integers above i64::MAX stay exact JSON numbers instead of
            // losing digits as floats.
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None if n.is_u64() => Self::Json(JsonValue::Number(n)),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Serialize any serde value into the graph, naming `field` on failure.
    pub fn serialize<T: Serialize + ?Sized>(field: &str, value: &T) -> DbResult<Self> {
        serde_json::to_value(value)
            .map(Self::from_json)
            .map_err(|e| DbError::serialization(field, e.to_string()))
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    f64 => Float,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
    NaiveDate => Date,
    Decimal => Decimal,
    JsonValue => Json,
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl From<BTreeMap<String, FieldValue>> for FieldValue {
    fn from(v: BTreeMap<String, FieldValue>) -> Self {
        Self::Map(v)
    }
}
