//! Field classification for record schemas.
//!
//! The [`TypeInspector`] looks at each declared field type and decides how the
//! repository stores it: as a JSON document, as a native array, or as a plain
//! scalar. Results are cached per schema id.

use crate::models::{FieldType, RecordSchema};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, warn};

/// How a field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Scalar,
    /// A native PostgreSQL array column.
    Array,
    /// A `jsonb` column.
    JsonDocument,
}

/// Field name to [`FieldKind`] for one schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldClassification {
    kinds: BTreeMap<String, FieldKind>,
}

impl FieldClassification {
    pub fn get(&self, field: &str) -> Option<FieldKind> {
        self.kinds.get(field).copied()
    }

    /// Kind of `field`, `Scalar` when unknown.
    pub fn kind(&self, field: &str) -> FieldKind {
        self.get(field).unwrap_or(FieldKind::Scalar)
    }

    pub fn is_json(&self, field: &str) -> bool {
        self.kind(field) == FieldKind::JsonDocument
    }

    pub fn json_fields(&self) -> Vec<&str> {
        self.of_kind(FieldKind::JsonDocument)
    }

    pub fn array_fields(&self) -> Vec<&str> {
        self.of_kind(FieldKind::Array)
    }

    fn of_kind(&self, kind: FieldKind) -> Vec<&str> {
        self.kinds
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.kinds.iter().map(|(name, kind)| (name.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn set(&mut self, field: impl Into<String>, kind: FieldKind) {
        self.kinds.insert(field.into(), kind);
    }
}

/// Per-repository adjustments applied on top of the inferred classification.
///
/// Precedence: `array_fields`, then `date_fields`, then `json_fields`, then
/// inference (unless `auto_detect` is off).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationOverrides {
    /// When set, exactly these fields are JSON documents.
    pub json_fields: Option<BTreeSet<String>>,
    pub auto_detect: bool,
    pub array_fields: BTreeSet<String>,
    pub date_fields: BTreeSet<String>,
}

impl Default for ClassificationOverrides {
    fn default() -> Self {
        Self {
            json_fields: None,
            auto_detect: true,
            array_fields: BTreeSet::new(),
            date_fields: BTreeSet::new(),
        }
    }
}

impl ClassificationOverrides {
    pub fn apply(&self, inferred: &FieldClassification) -> FieldClassification {
        let mut names: BTreeSet<&str> = inferred.kinds.keys().map(String::as_str).collect();
        names.extend(self.array_fields.iter().map(String::as_str));
        names.extend(self.date_fields.iter().map(String::as_str));
        if let Some(json) = &self.json_fields {
            names.extend(json.iter().map(String::as_str));
        }

        let mut result = FieldClassification::default();
        for name in names {
            let kind = if self.array_fields.contains(name) {
                FieldKind::Array
            } else if self.date_fields.contains(name) {
                FieldKind::Scalar
            } else if let Some(json) = &self.json_fields {
                if json.contains(name) {
                    FieldKind::JsonDocument
                } else {
                    FieldKind::Scalar
                }
            } else if self.auto_detect {
                inferred.kind(name)
            } else {
                FieldKind::Scalar
            };
            result.set(name, kind);
        }
        result
    }
}

/// Classifies record schemas and caches the result by schema id.
#[derive(Debug, Default)]
pub struct TypeInspector {
    cache: RwLock<HashMap<String, Arc<FieldClassification>>>,
    registry: RwLock<HashMap<String, FieldType>>,
    computations: AtomicUsize,
}

static GLOBAL: OnceLock<Arc<TypeInspector>> = OnceLock::new();

impl TypeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide inspector shared by repositories that do not bring their own.
    pub fn global() -> Arc<TypeInspector> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TypeInspector::new())))
    }

    /// Make `name` resolvable from deferred declarations in any schema.
    /// Cached classifications are discarded.
    pub fn register_type(&self, name: impl Into<String>, ty: FieldType) {
        let name = name.into();
        debug!(type_name = %name, field_type = %ty, "Registering type");
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, ty);
        self.clear_cache();
    }

    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Number of classifications actually computed (cache misses).
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    pub fn cached_schemas(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Classify every field of `schema`, reusing the cached result for its id.
    pub fn classify(&self, schema: &RecordSchema) -> Arc<FieldClassification> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(schema.id())
        {
            return Arc::clone(hit);
        }

        let mut classification = FieldClassification::default();
        for decl in schema.fields() {
            let kind = self.classify_type(schema, &decl.ty);
            classification.set(decl.name.clone(), kind);
        }
        self.computations.fetch_add(1, Ordering::Relaxed);
        debug!(
            schema = schema.id(),
            json_fields = ?classification.json_fields(),
            "Classified record schema"
        );

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            cache
                .entry(schema.id().to_string())
                .or_insert_with(|| Arc::new(classification)),
        )
    }

    /// Classify a single declared type in the context of `schema`.
    pub fn classify_type(&self, schema: &RecordSchema, ty: &FieldType) -> FieldKind {
        let mut resolving = Vec::new();
        self.kind_of(schema, ty, &mut resolving)
    }

    fn kind_of(&self, schema: &RecordSchema, ty: &FieldType, resolving: &mut Vec<String>) -> FieldKind {
        match ty {
            FieldType::Map(_) | FieldType::List(_) | FieldType::Set(_) | FieldType::Struct(_) => {
                FieldKind::JsonDocument
            }
            FieldType::Optional(inner) => self.kind_of(schema, inner, resolving),
            FieldType::Union(members) => {
                let structured = members
                    .iter()
                    .any(|m| self.kind_of(schema, m, resolving) == FieldKind::JsonDocument);
                if structured {
                    FieldKind::JsonDocument
                } else {
                    FieldKind::Scalar
                }
            }
            FieldType::Deferred(name) => {
                if resolving.iter().any(|n| n == name) {
                    warn!(schema = schema.id(), type_name = %name, "Cyclic type reference; treating as scalar");
                    return FieldKind::Scalar;
                }
                let Some(resolved) = self.resolve(schema, name) else {
                    warn!(schema = schema.id(), type_name = %name, "Unresolved type reference; treating as scalar");
                    return FieldKind::Scalar;
                };
                resolving.push(name.clone());
                let kind = self.kind_of(schema, &resolved, resolving);
                resolving.pop();
                kind
            }
            _ => FieldKind::Scalar,
        }
    }

    fn resolve(&self, schema: &RecordSchema, name: &str) -> Option<FieldType> {
        if let Some(ty) = schema.definition(name) {
            return Some(ty.clone());
        }
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}
