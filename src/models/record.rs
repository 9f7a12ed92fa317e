//! Record schemas.
//!
//! A [`RecordSchema`] is the description the type inspector classifies: a
//! stable identifier, the declared type of every field, and optional local
//! definitions used to resolve [`FieldType::Deferred`] references.

use super::FieldType;
use crate::error::DbResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// A single declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: FieldType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    id: String,
    fields: Vec<FieldDecl>,
    definitions: BTreeMap<String, FieldType>,
}

impl RecordSchema {
    /// Start a schema. `id` must be stable: classifications are cached by it.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
            definitions: BTreeMap::new(),
        }
    }

    /// Declare a field. Redeclaring a name replaces the earlier type.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.ty = ty,
            None => self.fields.push(FieldDecl { name, ty }),
        }
        self
    }

    /// Declare a field from Rust type syntax, e.g. `"Option<Vec<String>>"`.
    pub fn parse_field(self, name: impl Into<String>, ty: &str) -> DbResult<Self> {
        let ty = ty.parse()?;
        Ok(self.field(name, ty))
    }

    /// Define a named type that deferred references in this schema resolve to.
    pub fn define(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.definitions.insert(name.into(), ty);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_type(name).is_some()
    }

    pub fn definition(&self, name: &str) -> Option<&FieldType> {
        self.definitions.get(name)
    }
}

/// A typed record stored in one table row.
///
/// Serialization goes through serde; the schema tells the repository which
/// serialized fields are JSON documents, native arrays or plain scalars.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn schema() -> DbResult<RecordSchema>;
}

/// Build a [`RecordSchema`] from Rust field types.
///
/// Expands to a `DbResult<RecordSchema>`; each type is parsed with
/// [`FieldType::from_str`](std::str::FromStr).
///
/// ```
/// use pg_toolkit::record_schema;
///
/// let schema = record_schema!("User" {
///     id: uuid::Uuid,
///     email: String,
///     tags: Vec<String>,
///     metadata: Option<HashMap<String, serde_json::Value>>,
/// })
/// .unwrap();
/// assert_eq!(schema.fields().len(), 4);
/// ```
#[macro_export]
macro_rules! record_schema {
    ($id:literal { $($field:ident : $ty:ty),* $(,)? }) => {
        (|| -> $crate::error::DbResult<$crate::models::RecordSchema> {
            let schema = $crate::models::RecordSchema::new($id);
            $(
                let schema = schema.parse_field(stringify!($field), stringify!($ty))?;
            )*
            Ok(schema)
        })()
    };
}
