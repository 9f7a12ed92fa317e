//! Typed CRUD over one table.
//!
//! A [`Repository`] maps a [`Record`] type to rows of a single table. Fields
//! classified as JSON documents are written as JSONB, array fields as native
//! arrays and everything else as plain columns. Every operation runs on a
//! caller-supplied connection, so repositories compose with
//! [`TransactionScope`](crate::db::TransactionScope):
//!
//! ```ignore
//! let users = Repository::<User>::builder("users").build(&pool)?;
//! manager
//!     .transaction(|tx| Box::pin(async move {
//!         users.create(tx.connection(), &user).await
//!     }))
//!     .await?;
//! ```

mod mapping;

use crate::config::JsonMode;
use crate::db::driver::{Connector, DriverConnection, Row};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::sql::{self, ColumnValue, Statement};
use crate::error::{DbError, DbResult};
use crate::json::{ClassificationOverrides, FieldClassification, TypeInspector};
use crate::models::field_type::json_kind;
use crate::models::{FieldMap, FieldValue, Record, RecordSchema};
use mapping::{Purpose, RecordMapper};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument};

/// What to do with a JSON field that fails to encode or decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail the operation.
    #[default]
    Strict,
    /// Log a warning; decode failures read as null, encode failures leave
    /// the column out of the statement.
    Lenient,
}

/// Builder for [`Repository`].
#[derive(Debug, Clone)]
pub struct RepositoryBuilder<T: Record> {
    table: String,
    primary_key: String,
    overrides: ClassificationOverrides,
    json_mode: Option<JsonMode>,
    error_policy: ErrorPolicy,
    inspector: Option<Arc<TypeInspector>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> RepositoryBuilder<T> {
    fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: "id".to_string(),
            overrides: ClassificationOverrides::default(),
            json_mode: None,
            error_policy: ErrorPolicy::default(),
            inspector: None,
            _record: PhantomData,
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Treat exactly these fields as JSON documents.
    pub fn json_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.json_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Infer JSON fields from the schema (on by default).
    pub fn auto_detect_json(mut self, enabled: bool) -> Self {
        self.overrides.auto_detect = enabled;
        self
    }

    /// Fields stored as native arrays rather than JSONB.
    pub fn array_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.array_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fields stored in `DATE`/`TIMESTAMP` columns whose values may arrive
    /// as ISO-8601 text.
    pub fn date_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.date_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Pin the JSON mode. Building against a pool with a different mode fails.
    pub fn json_mode(mut self, mode: JsonMode) -> Self {
        self.json_mode = Some(mode);
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Use a private inspector instead of the process-wide one.
    pub fn inspector(mut self, inspector: Arc<TypeInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Build for use with `pool`, adopting its JSON mode.
    pub fn build<C: Connector>(self, pool: &ConnectionPool<C>) -> DbResult<Repository<T>> {
        let pool_mode = pool.json_mode();
        if let Some(mode) = self.json_mode {
            if mode != pool_mode {
                return Err(DbError::configuration(format!(
                    "Repository for '{}' uses {} JSON mode but the pool is configured for {} mode",
                    self.table, mode, pool_mode
                )));
            }
        }
        self.build_for_mode(pool_mode)
    }

    /// Build without a pool. The mode must match whatever pool the
    /// connections later come from.
    pub fn build_for_mode(self, mode: JsonMode) -> DbResult<Repository<T>> {
        if let Some(pinned) = self.json_mode {
            if pinned != mode {
                return Err(DbError::configuration(format!(
                    "Repository for '{}' pinned to {} JSON mode, requested {}",
                    self.table, pinned, mode
                )));
            }
        }
        sql::validate_qualified_name(&self.table)?;
        sql::validate_identifier(&self.primary_key)?;
        let named = self
            .overrides
            .array_fields
            .iter()
            .chain(self.overrides.date_fields.iter())
            .chain(self.overrides.json_fields.iter().flatten());
        for field in named {
            sql::validate_identifier(field)?;
        }

        let schema = T::schema()?;
        let inspector = self.inspector.unwrap_or_else(TypeInspector::global);
        let inferred = inspector.classify(&schema);
        let classification = self.overrides.apply(&inferred);

        debug!(
            table = %self.table,
            schema = schema.id(),
            json_mode = %mode,
            json_fields = ?classification.json_fields(),
            array_fields = ?classification.array_fields(),
            "Repository configured"
        );

        Ok(Repository {
            table: self.table,
            primary_key: self.primary_key,
            schema,
            classification,
            date_fields: self.overrides.date_fields,
            json_mode: mode,
            error_policy: self.error_policy,
            _record: PhantomData,
        })
    }
}

/// CRUD operations for records of type `T` stored in one table.
#[derive(Debug)]
pub struct Repository<T: Record> {
    table: String,
    primary_key: String,
    schema: RecordSchema,
    classification: FieldClassification,
    date_fields: BTreeSet<String>,
    json_mode: JsonMode,
    error_policy: ErrorPolicy,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Repository<T> {
    pub fn builder(table: impl Into<String>) -> RepositoryBuilder<T> {
        RepositoryBuilder::new(table)
    }

    /// Repository with default settings for `pool`.
    pub fn new<C: Connector>(table: impl Into<String>, pool: &ConnectionPool<C>) -> DbResult<Self> {
        Self::builder(table).build(pool)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn classification(&self) -> &FieldClassification {
        &self.classification
    }

    pub fn json_mode(&self) -> JsonMode {
        self.json_mode
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    fn mapper(&self) -> RecordMapper<'_> {
        RecordMapper {
            table: &self.table,
            schema: &self.schema,
            classification: &self.classification,
            date_fields: &self.date_fields,
            json_mode: self.json_mode,
            policy: self.error_policy,
        }
    }

    fn key_column(&self, id: &FieldValue) -> DbResult<ColumnValue> {
        if id.is_null() {
            return Err(DbError::invalid_input(format!(
                "Primary key '{}' must not be null",
                self.primary_key
            )));
        }
        self.mapper()
            .column(&self.primary_key, id, Purpose::Update)?
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Primary key '{}' cannot be bound",
                    self.primary_key
                ))
            })
    }

    fn insert_columns(&self, record: &T) -> DbResult<Vec<ColumnValue>> {
        let object = match serde_json::to_value(record) {
            Ok(JsonValue::Object(object)) => object,
            Ok(other) => {
                return Err(DbError::serialization(
                    self.schema.id(),
                    format!("record serialized to {} instead of an object", json_kind(&other)),
                ));
            }
            Err(e) => {
                let message = e.to_string();
                let field = named_field(&message).unwrap_or(self.schema.id()).to_string();
                return Err(DbError::serialization(field, message));
            }
        };

        let mapper = self.mapper();
        let mut columns = Vec::with_capacity(object.len());
        for (field, value) in object {
            if field == self.primary_key && value.is_null() {
                // Let the column default generate the key.
                continue;
            }
            if !mapper.check_outgoing(&field, &value)? {
                continue;
            }
            let value = FieldValue::from_json(value);
            if let Some(column) = mapper.column(&field, &value, Purpose::Insert)? {
                columns.push(column);
            }
        }
        Ok(columns)
    }

    fn to_record(&self, row: Row) -> DbResult<T> {
        let object = self.mapper().decode_row(row)?;
        let value = JsonValue::Object(object);
        serde_json::from_value(value.clone()).map_err(|e| {
            let message = e.to_string();
            let field = named_field(&message).unwrap_or(self.schema.id()).to_string();
            let raw = match &value {
                JsonValue::Object(object) if field != self.schema.id() => {
                    object.get(field.as_str()).map(JsonValue::to_string).unwrap_or_default()
                }
                _ => value.to_string(),
            };
            DbError::deserialization(field, &raw, message)
        })
    }

    async fn fetch_one<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        statement: &Statement,
    ) -> DbResult<Option<Row>> {
        conn.query_opt(&statement.sql, &statement.params)
            .await
            .map_err(|e| e.with_table(&self.table))
    }

    /// Insert `record` and return it as stored, with server defaults filled in.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn create<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        record: &T,
    ) -> DbResult<T> {
        let columns = self.insert_columns(record)?;
        let statement = Statement::insert(&self.table, &columns)?;
        let row = self.fetch_one(conn, &statement).await?.ok_or_else(|| {
            DbError::operation("create", format!("INSERT into '{}' returned no row", self.table))
        })?;
        debug!(columns = columns.len(), "Record created");
        self.to_record(row)
    }

    /// Insert each record in order. Wrap the call in a transaction for
    /// all-or-nothing behavior.
    #[instrument(skip_all, fields(table = %self.table, count = records.len()))]
    pub async fn create_bulk<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        records: &[T],
    ) -> DbResult<Vec<T>> {
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            created.push(self.create(&mut *conn, record).await?);
        }
        Ok(created)
    }

    /// Fetch one record by primary key. A missing row is `RecordNotFound`.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn get_by_id<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        id: impl Into<FieldValue>,
    ) -> DbResult<T> {
        let key = self.key_column(&id.into())?;
        let statement = Statement::select_by(&self.table, &key)?;
        match self.fetch_one(conn, &statement).await? {
            Some(row) => self.to_record(row),
            None => Err(DbError::record_not_found(&self.table, key.param.display_key())),
        }
    }

    /// Like [`get_by_id`](Self::get_by_id) but `None` for a missing row.
    pub async fn find_by_id<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        id: impl Into<FieldValue>,
    ) -> DbResult<Option<T>> {
        match self.get_by_id(conn, id).await {
            Ok(record) => Ok(Some(record)),
            Err(DbError::RecordNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All records ordered by primary key.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn get_all<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
    ) -> DbResult<Vec<T>> {
        let statement = Statement::select_all(&self.table, &self.primary_key)?;
        let rows = conn
            .query(&statement.sql, &statement.params)
            .await
            .map_err(|e| e.with_table(&self.table))?;
        debug!(rows = rows.len(), "Records fetched");
        rows.into_iter().map(|row| self.to_record(row)).collect()
    }

    /// Apply `changes` to the record with key `id` and return the result.
    /// A `Null` value clears the column.
    #[instrument(skip_all, fields(table = %self.table, fields = changes.len()))]
    pub async fn update<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        id: impl Into<FieldValue>,
        changes: FieldMap,
    ) -> DbResult<T> {
        if changes.is_empty() {
            return Err(DbError::invalid_input("update requires at least one field"));
        }
        let key = self.key_column(&id.into())?;
        let mapper = self.mapper();
        let mut columns = Vec::with_capacity(changes.len());
        for (field, value) in &changes {
            if let Some(column) = mapper.column(field, value, Purpose::Update)? {
                columns.push(column);
            }
        }
        let statement = Statement::update(&self.table, &key, &columns)?;
        match self.fetch_one(conn, &statement).await? {
            Some(row) => self.to_record(row),
            None => Err(DbError::record_not_found(&self.table, key.param.display_key())),
        }
    }

    /// Delete the record with key `id`. Deleting nothing is `RecordNotFound`.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn delete<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        id: impl Into<FieldValue>,
    ) -> DbResult<()> {
        let key = self.key_column(&id.into())?;
        let statement = Statement::delete(&self.table, &key)?;
        let affected = conn
            .execute(&statement.sql, &statement.params)
            .await
            .map_err(|e| e.with_table(&self.table))?;
        if affected == 0 {
            return Err(DbError::record_not_found(&self.table, key.param.display_key()));
        }
        debug!(affected, "Record deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn exists<Conn: DriverConnection>(
        &self,
        conn: &mut PooledConnection<Conn>,
        id: impl Into<FieldValue>,
    ) -> DbResult<bool> {
        let key = self.key_column(&id.into())?;
        let statement = Statement::exists(&self.table, &key)?;
        let row = self.fetch_one(conn, &statement).await?;
        Ok(row
            .and_then(|row| row.get("exists").and_then(JsonValue::as_bool))
            .unwrap_or(false))
    }
}

/// The field serde names in messages such as "missing field `email`".
fn named_field(message: &str) -> Option<&str> {
    let start = message.find(" field `")? + " field `".len();
    let len = message[start..].find('`')?;
    Some(&message[start..start + len]).filter(|name| !name.is_empty())
}
