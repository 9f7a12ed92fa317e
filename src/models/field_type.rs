//! Declared field types.
//!
//! A record schema maps each field to a [`FieldType`]. Types can be built with
//! the constructors or parsed from Rust type syntax, so a schema can be written
//! next to the struct it describes:
//!
//! ```
//! use pg_toolkit::models::FieldType;
//!
//! let ty: FieldType = "Option<HashMap<String, serde_json::Value>>".parse().unwrap();
//! assert_eq!(ty, FieldType::optional(FieldType::map(FieldType::Any)));
//! ```

use crate::error::DbError;
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Uuid,
    Date,
    Timestamp,
    Decimal,
    /// Any JSON value (`serde_json::Value`).
    Any,
    /// String-keyed mapping with the given value type.
    Map(Box<FieldType>),
    List(Box<FieldType>),
    Set(Box<FieldType>),
    /// Nested record serialized as an object.
    Struct(String),
    Optional(Box<FieldType>),
    Union(Vec<FieldType>),
    /// Reference to a type defined elsewhere, resolved before classification.
    Deferred(String),
}

impl FieldType {
    pub fn map(value: FieldType) -> Self {
        Self::Map(Box::new(value))
    }

    pub fn list(item: FieldType) -> Self {
        Self::List(Box::new(item))
    }

    pub fn set(item: FieldType) -> Self {
        Self::Set(Box::new(item))
    }

    pub fn optional(inner: FieldType) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn union(members: impl IntoIterator<Item = FieldType>) -> Self {
        Self::Union(members.into_iter().collect())
    }

    pub fn deferred(name: impl Into<String>) -> Self {
        Self::Deferred(name.into())
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_))
    }

    /// Strip any number of `Optional` wrappers.
    pub fn unwrap_optional(&self) -> &FieldType {
        match self {
            Self::Optional(inner) => inner.unwrap_optional(),
            other => other,
        }
    }

    /// Element type of a list or set.
    pub fn element(&self) -> Option<&FieldType> {
        match self.unwrap_optional() {
            Self::List(item) | Self::Set(item) => Some(item),
            _ => None,
        }
    }

    /// Check that `value` has the JSON shape a value of this type serializes
    /// to. The error names the nested path that did not match.
    ///
    /// Structs and deferred types are only checked down to "is an object" and
    /// "anything" respectively.
    pub fn check_json(&self, value: &JsonValue) -> Result<(), String> {
        let expect = |ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(format!("expected {}, found {}", self, json_kind(value)))
            }
        };
        match self {
            Self::Optional(_) if value.is_null() => Ok(()),
            Self::Optional(inner) => inner.check_json(value),
            Self::Any | Self::Deferred(_) => Ok(()),
            Self::Bool => expect(value.is_boolean()),
            Self::Int => expect(value.is_i64() || value.is_u64()),
            Self::Float => expect(value.is_number()),
            Self::Text | Self::Uuid | Self::Date | Self::Timestamp => expect(value.is_string()),
            Self::Decimal => expect(value.is_string() || value.is_number()),
            Self::Bytes => expect(
                value.is_string()
                    || value.as_array().is_some_and(|items| {
                        items.iter().all(|b| b.as_u64().is_some_and(|b| b <= 255))
                    }),
            ),
            Self::Struct(_) => expect(value.is_object()),
            Self::Map(inner) => match value.as_object() {
                Some(map) => map.iter().try_for_each(|(key, item)| {
                    inner.check_json(item).map_err(|e| format!("{}: {}", key, e))
                }),
                None => expect(false),
            },
            Self::List(inner) | Self::Set(inner) => match value.as_array() {
                Some(items) => items.iter().enumerate().try_for_each(|(i, item)| {
                    inner.check_json(item).map_err(|e| format!("[{}]: {}", i, e))
                }),
                None => expect(false),
            },
            Self::Union(members) => expect(members.iter().any(|m| m.check_json(value).is_ok())),
        }
    }
}

/// Article and name of a JSON value's kind, for messages.
pub(crate) fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "i64"),
            Self::Float => write!(f, "f64"),
            Self::Text => write!(f, "String"),
            Self::Bytes => write!(f, "Vec<u8>"),
            Self::Uuid => write!(f, "Uuid"),
            Self::Date => write!(f, "NaiveDate"),
            Self::Timestamp => write!(f, "DateTime<Utc>"),
            Self::Decimal => write!(f, "Decimal"),
            Self::Any => write!(f, "Value"),
            Self::Map(v) => write!(f, "HashMap<String, {}>", v),
            Self::List(v) => write!(f, "Vec<{}>", v),
            Self::Set(v) => write!(f, "HashSet<{}>", v),
            Self::Struct(name) | Self::Deferred(name) => write!(f, "{}", name),
            Self::Optional(v) => write!(f, "Option<{}>", v),
            Self::Union(members) => {
                write!(f, "Union<")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, ">")
            }
        }
    }
}

impl FromStr for FieldType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser::new(s);
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(ty)
    }
}

/// Recursive-descent parser over Rust type syntax.
struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TypeParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, message: &str) -> DbError {
        DbError::invalid_input(format!(
            "cannot parse type '{}' at offset {}: {}",
            self.input, self.pos, message
        ))
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        (self.pos > start).then(|| &self.input[start..self.pos])
    }

    /// A `::`-separated path; only the last segment matters.
    fn path(&mut self) -> Result<&'a str, DbError> {
        let mut last = self.ident().ok_or_else(|| self.error("expected a type name"))?;
        loop {
            self.skip_ws();
            if self.input[self.pos..].starts_with("::") {
                self.pos += 2;
                last = self.ident().ok_or_else(|| self.error("expected a path segment"))?;
            } else {
                return Ok(last);
            }
        }
    }

    fn generics(&mut self) -> Result<Vec<FieldType>, DbError> {
        let mut args = Vec::new();
        if !self.eat('<') {
            return Ok(args);
        }
        loop {
            args.push(self.parse_type()?);
            if self.eat(',') {
                continue;
            }
            if self.eat('>') {
                return Ok(args);
            }
            return Err(self.error("expected ',' or '>'"));
        }
    }

    /// Consume `<u8>` if it follows; a byte vector is a scalar, not a list.
    fn byte_element(&mut self) -> bool {
        let start = self.pos;
        if self.eat('<') && self.ident() == Some("u8") && self.eat('>') {
            return true;
        }
        self.pos = start;
        false
    }

    fn parse_type(&mut self) -> Result<FieldType, DbError> {
        // References and lifetimes do not change the shape.
        if self.eat('&') {
            if self.eat('\'') {
                self.ident();
            }
            return self.parse_type();
        }

        let name = self.path()?;
        if matches!(name, "Vec" | "VecDeque") && self.byte_element() {
            return Ok(FieldType::Bytes);
        }
        let mut args = self.generics()?;
        let arity = |n: usize, args: &Vec<FieldType>| -> Result<(), DbError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(self.error(&format!("{} expects {} type argument(s)", name, n)))
            }
        };

        let ty = match name {
            "bool" => FieldType::Bool,
            "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64"
            | "u128" | "usize" => FieldType::Int,
            "f32" | "f64" => FieldType::Float,
            "String" | "str" | "char" => FieldType::Text,
            "Uuid" => FieldType::Uuid,
            "NaiveDate" => FieldType::Date,
            "DateTime" | "NaiveDateTime" | "OffsetDateTime" | "PrimitiveDateTime" => {
                FieldType::Timestamp
            }
            "Decimal" | "BigDecimal" => FieldType::Decimal,
            "Value" | "JsonValue" | "Any" => FieldType::Any,
            "Option" => {
                arity(1, &args)?;
                FieldType::optional(args.remove(0))
            }
            "Box" | "Arc" | "Rc" => {
                arity(1, &args)?;
                args.remove(0)
            }
            "Vec" | "VecDeque" | "LinkedList" => {
                arity(1, &args)?;
                FieldType::list(args.remove(0))
            }
            "HashSet" | "BTreeSet" | "IndexSet" => {
                arity(1, &args)?;
                FieldType::set(args.remove(0))
            }
            "HashMap" | "BTreeMap" | "IndexMap" | "Map" => {
                arity(2, &args)?;
                FieldType::map(args.remove(1))
            }
            "Union" => {
                if args.is_empty() {
                    return Err(self.error("Union needs at least one member"));
                }
                FieldType::Union(args)
            }
            other if args.is_empty() => FieldType::Deferred(other.to_string()),
            other => return Err(self.error(&format!("unknown generic type {}", other))),
        };
        Ok(ty)
    }
}
