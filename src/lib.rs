//! PostgreSQL data-access toolkit.
//!
//! - [`db::ConnectionPool`]: bounded pool with retrying, idempotent
//!   initialization, post-init hooks and health checks
//! - [`db::TransactionManager`]: nested transactions via savepoints, plus
//!   schema and data lifecycles around a unit of work
//! - [`repository::Repository`]: typed CRUD with JSONB document fields
//! - [`json`]: field classification and the JSON codec

pub mod config;
pub mod db;
pub mod error;
pub mod json;
pub mod models;
pub mod repository;

pub use config::{Config, JsonMode, PoolConfig};
pub use db::{
    ConnectionPool, PgConnector, PgPool, PooledConnection, TransactionManager, TransactionScope,
};
pub use error::{DbError, DbResult};
pub use json::{JsonCodec, TypeInspector};
pub use models::{FieldType, FieldValue, Record, RecordSchema};
pub use repository::{ErrorPolicy, Repository, RepositoryBuilder};
