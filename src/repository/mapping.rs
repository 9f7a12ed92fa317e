//! Conversion between record fields and statement parameters / result rows.

use super::ErrorPolicy;
use crate::config::JsonMode;
use crate::db::driver::Row;
use crate::db::sql::ColumnValue;
use crate::error::{DbError, DbResult};
use crate::json::{FieldClassification, FieldKind, JsonCodec};
use crate::models::{FieldType, FieldValue, QueryParam, RecordSchema};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

/// Which statement a column is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    Insert,
    Update,
}

/// Server type a scalar placeholder is cast to.
fn scalar_cast(ty: &FieldType) -> Option<&'static str> {
    match ty.unwrap_optional() {
        FieldType::Bool => Some("boolean"),
        FieldType::Int => Some("bigint"),
        FieldType::Float => Some("double precision"),
        FieldType::Text => Some("text"),
        FieldType::Bytes => Some("bytea"),
        FieldType::Uuid => Some("uuid"),
        FieldType::Date => Some("date"),
        FieldType::Timestamp => Some("timestamptz"),
        FieldType::Decimal => Some("numeric"),
        _ => None,
    }
}

fn array_cast(element: Option<&FieldType>) -> &'static str {
    match element.map(FieldType::unwrap_optional) {
        Some(FieldType::Int) => "bigint[]",
        Some(FieldType::Float) => "double precision[]",
        Some(FieldType::Bool) => "boolean[]",
        Some(FieldType::Uuid) => "uuid[]",
        _ => "text[]",
    }
}

fn mismatch(field: &str, expected: &FieldType, got: &FieldValue) -> DbError {
    DbError::serialization(
        field,
        format!("expected {}, got {}", expected, got.type_name()),
    )
}

/// Map a scalar value to a parameter, coercing text into the declared type.
pub(crate) fn scalar_param(field: &str, value: &FieldValue, ty: &FieldType) -> DbResult<QueryParam> {
    if value.is_null() {
        return Ok(QueryParam::Null);
    }
    let declared = ty.unwrap_optional();
    let param = match (declared, value) {
        (FieldType::Bool, FieldValue::Bool(b)) => QueryParam::Bool(*b),
        (FieldType::Int, FieldValue::Int(i)) => QueryParam::Int(*i),
        (FieldType::Float, FieldValue::Float(f)) => QueryParam::Float(*f),
        (FieldType::Float, FieldValue::Int(i)) => QueryParam::Float(*i as f64),
        (FieldType::Text, FieldValue::Text(s)) => QueryParam::String(s.clone()),
        (FieldType::Uuid, FieldValue::Uuid(u)) => QueryParam::Uuid(*u),
        (FieldType::Uuid, FieldValue::Text(s)) => QueryParam::Uuid(
            Uuid::parse_str(s).map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Timestamp, FieldValue::Timestamp(t)) => QueryParam::Timestamp(*t),
        (FieldType::Timestamp, FieldValue::Text(s)) => QueryParam::Timestamp(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| DbError::serialization(field, e.to_string()))?
                .with_timezone(&Utc),
        ),
        (FieldType::Date, FieldValue::Date(d)) => QueryParam::Date(*d),
        (FieldType::Date, FieldValue::Text(s)) => QueryParam::Date(
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Decimal, FieldValue::Decimal(d)) => QueryParam::Decimal(*d),
        (FieldType::Decimal, FieldValue::Text(s)) => QueryParam::Decimal(
            Decimal::from_str(s).map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Decimal, FieldValue::Int(i)) => QueryParam::Decimal(Decimal::from(*i)),
        (FieldType::Decimal, FieldValue::Json(JsonValue::Number(n))) => QueryParam::Decimal(
            Decimal::from_str(&n.to_string())
                .map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Decimal, FieldValue::Float(f)) => QueryParam::Decimal(
            Decimal::try_from(*f).map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Bytes, FieldValue::Bytes(b)) => QueryParam::Bytes(b.clone()),
        (FieldType::Bytes, FieldValue::Text(s)) => QueryParam::Bytes(
            STANDARD
                .decode(s)
                .map_err(|e| DbError::serialization(field, e.to_string()))?,
        ),
        (FieldType::Bytes, FieldValue::List(items)) => QueryParam::Bytes(
            items
                .iter()
                .map(|item| match item {
                    FieldValue::Int(i) => u8::try_from(*i)
                        .map_err(|_| DbError::serialization(field, format!("{} is not a byte", i))),
                    other => Err(mismatch(field, &FieldType::Int, other)),
                })
                .collect::<DbResult<_>>()?,
        ),
        (
            FieldType::Bool
            | FieldType::Int
            | FieldType::Float
            | FieldType::Text
            | FieldType::Uuid
            | FieldType::Timestamp
            | FieldType::Date
            | FieldType::Decimal
            | FieldType::Bytes,
            other,
        ) => return Err(mismatch(field, declared, other)),
        (_, other) => return inferred_param(field, other).map(|(param, _)| param),
    };
    Ok(param)
}

/// Parameter and cast for a value with no usable declared type.
fn inferred_param(field: &str, value: &FieldValue) -> DbResult<(QueryParam, Option<&'static str>)> {
    Ok(match value {
        FieldValue::Null => (QueryParam::Null, None),
        FieldValue::Bool(b) => (QueryParam::Bool(*b), None),
        FieldValue::Int(i) => (QueryParam::Int(*i), None),
        FieldValue::Float(f) => (QueryParam::Float(*f), None),
        FieldValue::Text(s) => (QueryParam::String(s.clone()), None),
        FieldValue::Bytes(b) => (QueryParam::Bytes(b.clone()), Some("bytea")),
        FieldValue::Uuid(u) => (QueryParam::Uuid(*u), Some("uuid")),
        FieldValue::Timestamp(t) => (QueryParam::Timestamp(*t), Some("timestamptz")),
        FieldValue::Date(d) => (QueryParam::Date(*d), Some("date")),
        FieldValue::Decimal(d) => (QueryParam::Decimal(*d), Some("numeric")),
        FieldValue::List(_) | FieldValue::Set(_) | FieldValue::Map(_) | FieldValue::Json(_) => (
            QueryParam::JsonText(JsonCodec::encode(field, value)?),
            Some("jsonb"),
        ),
        FieldValue::Opaque(type_name) => {
            return Err(DbError::serialization(
                field,
                format!("value of type {} cannot be bound", type_name),
            ));
        }
    })
}

/// Text in a date field: offset timestamps bind as `timestamptz`, bare dates
/// as `date`, anything else is left to the server's `timestamp` parser.
fn temporal_text(s: &str) -> (QueryParam, &'static str) {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return (QueryParam::Timestamp(ts.with_timezone(&Utc)), "timestamptz");
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return (QueryParam::Date(date), "date");
    }
    (QueryParam::String(s.to_string()), "timestamp")
}

fn array_param(field: &str, value: &FieldValue, element: Option<&FieldType>) -> DbResult<QueryParam> {
    let items = match value {
        v if v.is_null() => return Ok(QueryParam::Null),
        FieldValue::List(items) | FieldValue::Set(items) => items.clone(),
        FieldValue::Json(JsonValue::Array(items)) => {
            items.iter().cloned().map(FieldValue::from_json).collect()
        }
        other => {
            return Err(DbError::serialization(
                field,
                format!("expected a list for array column, got {}", other.type_name()),
            ));
        }
    };

    let element = match element.map(FieldType::unwrap_optional) {
        Some(ty @ (FieldType::Int | FieldType::Float | FieldType::Bool | FieldType::Uuid | FieldType::Text)) => {
            ty.clone()
        }
        _ => match items.first() {
            Some(FieldValue::Int(_)) => FieldType::Int,
            Some(FieldValue::Float(_)) => FieldType::Float,
            Some(FieldValue::Bool(_)) => FieldType::Bool,
            Some(FieldValue::Uuid(_)) => FieldType::Uuid,
            _ => FieldType::Text,
        },
    };

    let mut params = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let item_field = format!("{}[{}]", field, i);
        if item.is_null() {
            return Err(DbError::serialization(item_field, "array elements must not be null"));
        }
        params.push(scalar_param(&item_field, item, &element)?);
    }

    macro_rules! collect {
        ($variant:ident) => {
            params
                .into_iter()
                .filter_map(|p| match p {
                    QueryParam::$variant(v) => Some(v),
                    _ => None,
                })
                .collect()
        };
    }

    Ok(match element {
        FieldType::Int => QueryParam::IntArray(collect!(Int)),
        FieldType::Float => QueryParam::FloatArray(collect!(Float)),
        FieldType::Bool => QueryParam::BoolArray(collect!(Bool)),
        FieldType::Uuid => QueryParam::UuidArray(collect!(Uuid)),
        _ => QueryParam::TextArray(collect!(String)),
    })
}

/// Per-repository mapping rules.
#[derive(Debug)]
pub(crate) struct RecordMapper<'a> {
    pub table: &'a str,
    pub schema: &'a RecordSchema,
    pub classification: &'a FieldClassification,
    pub date_fields: &'a BTreeSet<String>,
    pub json_mode: JsonMode,
    pub policy: ErrorPolicy,
}

impl RecordMapper<'_> {
    fn json_param(&self, field: &str, value: &FieldValue) -> DbResult<QueryParam> {
        if value.is_null() {
            return Ok(QueryParam::Null);
        }
        match self.json_mode {
            JsonMode::Native => Ok(QueryParam::Json(JsonCodec::to_json(field, value)?)),
            JsonMode::Custom => Ok(QueryParam::JsonText(JsonCodec::encode(field, value)?)),
        }
    }

    /// The column for one field, or `None` when it should be left out.
    pub fn column(
        &self,
        field: &str,
        value: &FieldValue,
        purpose: Purpose,
    ) -> DbResult<Option<ColumnValue>> {
        let declared = self.schema.field_type(field);
        match self.classification.kind(field) {
            FieldKind::JsonDocument => match self.json_param(field, value) {
                Ok(param) => Ok(Some(ColumnValue::new(field, param).with_cast("jsonb"))),
                Err(e) if self.policy == ErrorPolicy::Lenient => {
                    warn!(table = self.table, field, error = %e, "Omitting JSON field that failed to encode");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            FieldKind::Array => {
                let element = declared.and_then(FieldType::element);
                let param = array_param(field, value, element)?;
                Ok(Some(ColumnValue::new(field, param).with_cast(array_cast(element))))
            }
            FieldKind::Scalar => {
                if self.date_fields.contains(field) {
                    if let FieldValue::Text(s) = value {
                        let (param, cast) = temporal_text(s);
                        return Ok(Some(ColumnValue::new(field, param).with_cast(cast)));
                    }
                }
                let (param, cast) = match declared.and_then(|ty| scalar_cast(ty).map(|c| (ty, c))) {
                    Some((ty, cast)) => (scalar_param(field, value, ty)?, Some(cast)),
                    None => inferred_param(field, value)?,
                };
                if param.is_null() && cast.is_none() && purpose == Purpose::Insert {
                    // Untyped NULL; the column default applies.
                    return Ok(None);
                }
                let column = ColumnValue::new(field, param);
                Ok(Some(match cast {
                    Some(cast) => column.with_cast(cast),
                    None => column,
                }))
            }
        }
    }

    /// Turn a result row into the JSON object the record deserializes from.
    ///
    /// Every declared field is checked against its type so a bad value is
    /// reported under its own name. Under the lenient policy a JSON field
    /// that does not fit reads as null.
    pub fn decode_row(&self, row: Row) -> DbResult<Map<String, JsonValue>> {
        let mut object = Map::with_capacity(row.len());
        for (column, value) in row {
            let kind = self.classification.kind(&column);
            let value = match kind {
                FieldKind::JsonDocument => self.decode_json_column(&column, value)?,
                _ => self.decode_scalar_column(&column, value)?,
            };
            let value = match self.shape_error(&column, &value) {
                None => value,
                Some(reason) if self.lenient_json(kind) => {
                    warn!(table = self.table, field = %column, reason = %reason, "Treating JSON field with unexpected shape as null");
                    JsonValue::Null
                }
                Some(reason) => {
                    return Err(DbError::deserialization(&column, &value.to_string(), reason));
                }
            };
            object.insert(column, value);
        }
        Ok(object)
    }

    /// Check one serialized field against its declared type before it is
    /// bound. `false` means the field is left out of the statement.
    pub fn check_outgoing(&self, field: &str, value: &JsonValue) -> DbResult<bool> {
        match self.shape_error(field, value) {
            None => Ok(true),
            Some(reason) if self.lenient_json(self.classification.kind(field)) => {
                warn!(table = self.table, field, reason = %reason, "Omitting JSON field with unexpected shape");
                Ok(false)
            }
            Some(reason) => Err(DbError::serialization(field, reason)),
        }
    }

    fn shape_error(&self, field: &str, value: &JsonValue) -> Option<String> {
        self.schema.field_type(field)?.check_json(value).err()
    }

    fn lenient_json(&self, kind: FieldKind) -> bool {
        kind == FieldKind::JsonDocument && self.policy == ErrorPolicy::Lenient
    }

    fn decode_json_column(&self, column: &str, value: JsonValue) -> DbResult<JsonValue> {
        let JsonValue::String(raw) = value else {
            return Ok(value);
        };
        if self.json_mode.is_native() {
            // Already parsed by the driver; a string here is a JSON string.
            return Ok(JsonValue::String(raw));
        }
        match JsonCodec::decode(column, &raw) {
            Ok(decoded) => Ok(decoded),
            Err(e) if self.policy == ErrorPolicy::Lenient => {
                warn!(table = self.table, field = column, error = %e, "Treating undecodable JSON field as null");
                Ok(JsonValue::Null)
            }
            Err(e) => Err(e),
        }
    }

    fn decode_scalar_column(&self, column: &str, value: JsonValue) -> DbResult<JsonValue> {
        let declared = self.schema.field_type(column).map(FieldType::unwrap_optional);
        match value {
            JsonValue::String(encoded) if matches!(declared, Some(FieldType::Bytes)) => {
                let bytes = STANDARD
                    .decode(&encoded)
                    .map_err(|e| DbError::deserialization(column, &encoded, e.to_string()))?;
                Ok(JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect()))
            }
            JsonValue::String(raw) if self.stored_as_jsonb(declared, &raw) => {
                Ok(JsonCodec::decode(column, &raw).unwrap_or(JsonValue::String(raw)))
            }
            other => Ok(other),
        }
    }

    /// Structured values in a field without a scalar type are written as
    /// jsonb, which comes back as text in custom mode.
    fn stored_as_jsonb(&self, declared: Option<&FieldType>, raw: &str) -> bool {
        let structured = matches!(
            declared,
            Some(FieldType::Struct(_) | FieldType::Deferred(_) | FieldType::Union(_))
        );
        let trimmed = raw.trim_start();
        !self.json_mode.is_native() && structured && (trimmed.starts_with('{') || trimmed.starts_with('['))
    }
}
