//! Database layer.
//!
//! This module provides database access functionality:
//! - The driver boundary and its sqlx PostgreSQL implementation
//! - Connection pool management with retrying initialization
//! - Transactions, savepoints and schema/data lifecycles
//! - Safe SQL text for the repository

pub mod driver;
pub mod pool;
pub mod postgres;
pub mod retry;
pub mod sql;
pub mod transaction;
pub mod types;

pub use driver::{Connector, DriverConnection, Row};
pub use pool::{ConnectionPool, PooledConnection};
pub use postgres::{PgConnector, PgDriverConnection};
pub use retry::{RetryPolicy, RetryState, retry_with_backoff};
pub use sql::{ColumnValue, Statement};
pub use transaction::{
    DataManager, ManagedContext, NoData, NoSchema, SchemaManager, ScopeState, TransactionManager,
    TransactionScope,
};

/// A pool of sqlx PostgreSQL connections.
pub type PgPool = ConnectionPool<PgConnector>;
