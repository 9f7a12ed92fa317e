//! Safe SQL text for the repository.
//!
//! Identifiers are validated against a conservative pattern and always
//! double-quoted; values only ever travel as bind parameters.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check `name` is `[A-Za-z_][A-Za-z0-9_]*` and fits in an identifier.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(DbError::invalid_input("identifier must not be empty"));
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_input(format!(
            "identifier '{}' is longer than {} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    if !(first.is_ascii_alphabetic() || first == '_')
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DbError::invalid_input(format!(
            "invalid identifier '{}': use letters, digits and underscores, not starting with a digit",
            name
        )));
    }
    Ok(())
}

/// Validate a table name, optionally schema-qualified (`schema.table`).
pub fn validate_qualified_name(name: &str) -> DbResult<()> {
    let mut parts = name.split('.');
    let first = parts.next().unwrap_or_default();
    validate_identifier(first)?;
    match (parts.next(), parts.next()) {
        (None, _) => Ok(()),
        (Some(table), None) => validate_identifier(table),
        (Some(_), Some(_)) => Err(DbError::invalid_input(format!(
            "invalid table name '{}': at most one schema qualifier is allowed",
            name
        ))),
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote each dot-separated part of a (possibly qualified) name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

/// A column paired with the parameter bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub column: String,
    pub param: QueryParam,
    /// Server type the placeholder is cast to, e.g. `jsonb` or `uuid`.
    pub cast: Option<&'static str>,
}

impl ColumnValue {
    pub fn new(column: impl Into<String>, param: QueryParam) -> Self {
        Self {
            column: column.into(),
            param,
            cast: None,
        }
    }

    pub fn with_cast(mut self, cast: &'static str) -> Self {
        self.cast = Some(cast);
        self
    }

    fn placeholder(&self, index: usize) -> String {
        match self.cast {
            Some(cast) => format!("${}::{}", index, cast),
            None => format!("${}", index),
        }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    /// `INSERT ... RETURNING *`. No values inserts a row of defaults.
    pub fn insert(table: &str, values: &[ColumnValue]) -> DbResult<Self> {
        validate_qualified_name(table)?;
        let table = quote_qualified(table);
        if values.is_empty() {
            return Ok(Self {
                sql: format!("INSERT INTO {} DEFAULT VALUES RETURNING *", table),
                params: Vec::new(),
            });
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            validate_identifier(&value.column)?;
            columns.push(quote_identifier(&value.column));
            placeholders.push(value.placeholder(i + 1));
        }
        Ok(Self {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                table,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params: values.iter().map(|v| v.param.clone()).collect(),
        })
    }

    pub fn select_by(table: &str, key: &ColumnValue) -> DbResult<Self> {
        validate_qualified_name(table)?;
        validate_identifier(&key.column)?;
        Ok(Self {
            sql: format!(
                "SELECT * FROM {} WHERE {} = {}",
                quote_qualified(table),
                quote_identifier(&key.column),
                key.placeholder(1)
            ),
            params: vec![key.param.clone()],
        })
    }

    pub fn select_all(table: &str, order_by: &str) -> DbResult<Self> {
        validate_qualified_name(table)?;
        validate_identifier(order_by)?;
        Ok(Self {
            sql: format!(
                "SELECT * FROM {} ORDER BY {}",
                quote_qualified(table),
                quote_identifier(order_by)
            ),
            params: Vec::new(),
        })
    }

    /// `UPDATE ... RETURNING *`. Fails on an empty change set.
    pub fn update(table: &str, key: &ColumnValue, values: &[ColumnValue]) -> DbResult<Self> {
        validate_qualified_name(table)?;
        validate_identifier(&key.column)?;
        if values.is_empty() {
            return Err(DbError::invalid_input("update requires at least one column"));
        }
        let mut assignments = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            validate_identifier(&value.column)?;
            assignments.push(format!(
                "{} = {}",
                quote_identifier(&value.column),
                value.placeholder(i + 1)
            ));
        }
        let mut params: Vec<QueryParam> = values.iter().map(|v| v.param.clone()).collect();
        params.push(key.param.clone());
        Ok(Self {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = {} RETURNING *",
                quote_qualified(table),
                assignments.join(", "),
                quote_identifier(&key.column),
                key.placeholder(values.len() + 1)
            ),
            params,
        })
    }

    pub fn delete(table: &str, key: &ColumnValue) -> DbResult<Self> {
        validate_qualified_name(table)?;
        validate_identifier(&key.column)?;
        Ok(Self {
            sql: format!(
                "DELETE FROM {} WHERE {} = {}",
                quote_qualified(table),
                quote_identifier(&key.column),
                key.placeholder(1)
            ),
            params: vec![key.param.clone()],
        })
    }

    /// Returns one row with a boolean `exists` column.
    pub fn exists(table: &str, key: &ColumnValue) -> DbResult<Self> {
        validate_qualified_name(table)?;
        validate_identifier(&key.column)?;
        Ok(Self {
            sql: format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = {}) AS \"exists\"",
                quote_qualified(table),
                quote_identifier(&key.column),
                key.placeholder(1)
            ),
            params: vec![key.param.clone()],
        })
    }
}
