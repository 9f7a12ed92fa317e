//! PostgreSQL type mappings.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a column's server type name
//! 2. A per-category decoder extracts the value as JSON
//!
//! Parameters go the other way through [`bind_param`].

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgArguments, PgRow, PgValueFormat};
use sqlx::types::Json;
use sqlx::{Column as _, Postgres, Row, TypeInfo, ValueRef};
use uuid::Uuid;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for PostgreSQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    TimestampTz,
    Timestamp,
    Date,
    Time,
    Interval,
    TextArray,
    IntegerArray,
    FloatArray,
    BooleanArray,
    UuidArray,
    JsonArray,
    Unknown,
}

/// Classify a PostgreSQL type name (as reported by sqlx) into a category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let upper = type_name.to_ascii_uppercase();

    if let Some(element) = upper.strip_suffix("[]") {
        return match categorize_type(element) {
            TypeCategory::Integer => TypeCategory::IntegerArray,
            TypeCategory::Float => TypeCategory::FloatArray,
            TypeCategory::Boolean => TypeCategory::BooleanArray,
            TypeCategory::Uuid => TypeCategory::UuidArray,
            TypeCategory::Text => TypeCategory::TextArray,
            TypeCategory::Json => TypeCategory::JsonArray,
            _ => TypeCategory::Unknown,
        };
    }

    match upper.as_str() {
        "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "BIGINT" | "SERIAL" | "BIGSERIAL" => {
            TypeCategory::Integer
        }
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" => TypeCategory::Float,
        "NUMERIC" | "DECIMAL" => TypeCategory::Decimal,
        "BOOL" | "BOOLEAN" => TypeCategory::Boolean,
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => TypeCategory::Text,
        "BYTEA" => TypeCategory::Binary,
        "JSON" | "JSONB" => TypeCategory::Json,
        "UUID" => TypeCategory::Uuid,
        "TIMESTAMPTZ" => TypeCategory::TimestampTz,
        "TIMESTAMP" => TypeCategory::Timestamp,
        "DATE" => TypeCategory::Date,
        "TIME" => TypeCategory::Time,
        "INTERVAL" => TypeCategory::Interval,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Byte strings travel as standard base64 text.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Strip the jsonb version header from a binary-format value.
fn jsonb_text(bytes: &[u8], format: PgValueFormat) -> Result<&str, String> {
    let body = match (format, bytes.split_first()) {
        (PgValueFormat::Binary, Some((1, rest))) => rest,
        _ => bytes,
    };
    std::str::from_utf8(body).map_err(|e| format!("JSON column is not valid UTF-8: {}", e))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Exact text of a binary NUMERIC: base-10000 digit groups, a weight for the
/// first group and a display scale. Unlike `Decimal` this has no precision
/// limit and keeps `NaN` and the infinities.
fn numeric_text(bytes: &[u8]) -> Result<String, String> {
    let word = |i: usize| -> Result<u16, String> {
        bytes
            .get(i..i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".to_string())
    };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16 as i64;
    let sign = word(4)?;
    let dscale = word(6)? as usize;
    match sign {
        NUMERIC_POS | NUMERIC_NEG => {}
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        other => return Err(format!("invalid NUMERIC sign {:#06x}", other)),
    }
    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Result<Vec<u16>, String>>()?;
    let group = |pos: i64| -> u16 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for pos in 1..=weight {
            out.push_str(&format!("{:04}", group(pos)));
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(pos)));
            pos += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

fn interval_text(v: &PgInterval) -> String {
    let seconds = v.microseconds as f64 / 1_000_000.0;
    format!("P{}M{}DT{}S", v.months, v.days, seconds)
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Convert a row to a column-name → JSON map.
///
/// With `native_json` JSON columns come back parsed; without it they come back
/// as their raw text so the toolkit's codec can decode them. A column that
/// cannot be decoded fails the row with `Deserialization` naming the column.
pub fn row_to_json(row: &PgRow, native_json: bool) -> DbResult<serde_json::Map<String, JsonValue>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let column = Column { row, idx, name: col.name(), type_name: col.type_info().name() };
            let category = categorize_type(column.type_name);
            let value = decode_column(&column, category, native_json)?;
            Ok((col.name().to_string(), value))
        })
        .collect()
}

/// One column of a row being decoded.
struct Column<'r> {
    row: &'r PgRow,
    idx: usize,
    name: &'r str,
    type_name: &'r str,
}

impl Column<'_> {
    fn error(&self, message: impl std::fmt::Display) -> DbError {
        DbError::deserialization(
            self.name,
            "",
            format!("cannot decode {} column: {}", self.type_name, message),
        )
    }

    fn get<T>(&self) -> DbResult<Option<T>>
    where
        T: for<'a> sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres>,
    {
        self.row.try_get::<Option<T>, _>(self.idx).map_err(|e| self.error(e))
    }

    fn map<T>(&self, f: impl FnOnce(T) -> JsonValue) -> DbResult<JsonValue>
    where
        T: for<'a> sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres>,
    {
        Ok(self.get::<T>()?.map(f).unwrap_or(JsonValue::Null))
    }

    /// Undecoded bytes and their wire format; `None` for SQL NULL.
    fn raw(&self) -> DbResult<Option<(&[u8], PgValueFormat)>> {
        let raw = self.row.try_get_raw(self.idx).map_err(|e| self.error(e))?;
        if raw.is_null() {
            return Ok(None);
        }
        let format = raw.format();
        let bytes = raw.as_bytes().map_err(|e| self.error(e))?;
        Ok(Some((bytes, format)))
    }
}

fn decode_column(col: &Column<'_>, category: TypeCategory, native_json: bool) -> DbResult<JsonValue> {
    match category {
        TypeCategory::Integer => decode_integer(col),
        TypeCategory::Float => col.map::<f64>(float_value).or_else(|_| col.map::<f32>(|v| float_value(v as f64))),
        TypeCategory::Decimal => decode_decimal(col),
        TypeCategory::Boolean => col.map::<bool>(JsonValue::Bool),
        TypeCategory::Binary => col.map::<Vec<u8>>(|v| encode_binary_value(&v)),
        TypeCategory::Json if native_json => col.map::<JsonValue>(|v| v),
        TypeCategory::Json => decode_json_text(col),
        TypeCategory::Uuid => col.map::<Uuid>(|v| JsonValue::String(v.to_string())),
        TypeCategory::TimestampTz => col.map::<DateTime<Utc>>(|v| {
            JsonValue::String(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }),
        TypeCategory::Timestamp => col.map::<NaiveDateTime>(|v| {
            JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        TypeCategory::Date => col.map::<NaiveDate>(|v| JsonValue::String(v.to_string())),
        TypeCategory::Time => col.map::<NaiveTime>(|v| JsonValue::String(v.to_string())),
        TypeCategory::Interval => col.map::<PgInterval>(|v| JsonValue::String(interval_text(&v))),
        TypeCategory::TextArray => col.map::<Vec<String>>(|v| {
            JsonValue::Array(v.into_iter().map(JsonValue::String).collect())
        }),
        TypeCategory::IntegerArray => decode_integer_array(col),
        TypeCategory::FloatArray => col.map::<Vec<f64>>(|v| {
            JsonValue::Array(v.into_iter().map(float_value).collect())
        }),
        TypeCategory::BooleanArray => col.map::<Vec<bool>>(|v| {
            JsonValue::Array(v.into_iter().map(JsonValue::Bool).collect())
        }),
        TypeCategory::UuidArray => col.map::<Vec<Uuid>>(|v| {
            JsonValue::Array(v.into_iter().map(|u| JsonValue::String(u.to_string())).collect())
        }),
        TypeCategory::JsonArray => col.map::<Vec<Json<JsonValue>>>(|v| {
            JsonValue::Array(v.into_iter().map(|Json(item)| item).collect())
        }),
        TypeCategory::Text => col.map::<String>(JsonValue::String),
        TypeCategory::Unknown => decode_unknown(col),
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn decode_integer(col: &Column<'_>) -> DbResult<JsonValue> {
    match col.type_name.to_ascii_uppercase().as_str() {
        "INT2" | "SMALLINT" => col.map::<i16>(|v| JsonValue::Number(v.into())),
        "INT4" | "INTEGER" | "SERIAL" => col.map::<i32>(|v| JsonValue::Number(v.into())),
        _ => col.map::<i64>(|v| JsonValue::Number(v.into())),
    }
}

fn decode_integer_array(col: &Column<'_>) -> DbResult<JsonValue> {
    let to_json = |v: Vec<i64>| JsonValue::Array(v.into_iter().map(|n| n.into()).collect());
    match col.type_name.to_ascii_uppercase().as_str() {
        "INT2[]" | "SMALLINT[]" => {
            col.map::<Vec<i16>>(|v| to_json(v.into_iter().map(i64::from).collect()))
        }
        "INT4[]" | "INTEGER[]" | "SERIAL[]" => {
            col.map::<Vec<i32>>(|v| to_json(v.into_iter().map(i64::from).collect()))
        }
        _ => col.map::<Vec<i64>>(to_json),
    }
}

/// NUMERIC keeps its exact text form.
fn decode_decimal(col: &Column<'_>) -> DbResult<JsonValue> {
    let Some((bytes, format)) = col.raw()? else {
        return Ok(JsonValue::Null);
    };
    let text = match format {
        PgValueFormat::Binary => numeric_text(bytes).map_err(|e| col.error(e))?,
        PgValueFormat::Text => std::str::from_utf8(bytes)
            .map_err(|e| col.error(e))?
            .to_string(),
    };
    Ok(JsonValue::String(text))
}

fn decode_json_text(col: &Column<'_>) -> DbResult<JsonValue> {
    let Some((bytes, format)) = col.raw()? else {
        return Ok(JsonValue::Null);
    };
    let text = jsonb_text(bytes, format).map_err(|e| col.error(e))?;
    Ok(JsonValue::String(text.to_string()))
}

/// Types without a mapping come back as text when the server sent text;
/// binary values of unknown layout are an error rather than a silent NULL.
fn decode_unknown(col: &Column<'_>) -> DbResult<JsonValue> {
    if let Ok(value) = col.map::<String>(JsonValue::String) {
        return Ok(value);
    }
    match col.raw()? {
        None => Ok(JsonValue::Null),
        Some((bytes, PgValueFormat::Text)) => std::str::from_utf8(bytes)
            .map(|s| JsonValue::String(s.to_string()))
            .map_err(|e| col.error(e)),
        Some((_, PgValueFormat::Binary)) => Err(col.error(
            "no decoder for this type; cast it to text in the query",
        )),
    }
}

// =============================================================================
// Parameter Binding
// =============================================================================

/// Bind a parameter to a PostgreSQL query.
///
/// NULL binds as untyped text; the statement's `$n::type` cast gives it the
/// column type. `JsonText` binds as text for the same reason.
pub(crate) fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Uuid(v) => query.bind(*v),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::Date(v) => query.bind(*v),
        QueryParam::Decimal(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::JsonText(v) => query.bind(v.as_str()),
        QueryParam::TextArray(v) => query.bind(v.clone()),
        QueryParam::IntArray(v) => query.bind(v.clone()),
        QueryParam::FloatArray(v) => query.bind(v.clone()),
        QueryParam::BoolArray(v) => query.bind(v.clone()),
        QueryParam::UuidArray(v) => query.bind(v.clone()),
    }
}
