//! Driver boundary.
//!
//! The pool and the transaction orchestrator only need a connection that can
//! run parameterized statements, open and close transactions, and optionally
//! register a native JSON adapter. [`Connector`] opens such connections;
//! [`DriverConnection`] is the connection itself. The sqlx-backed PostgreSQL
//! implementation lives in [`crate::db::postgres`].

use crate::error::DbResult;
use crate::models::QueryParam;
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};

/// A result row: column name to JSON-mapped value.
pub type Row = Map<String, JsonValue>;

/// Opens connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: DriverConnection;

    /// Open and authenticate a new connection.
    async fn connect(&self) -> DbResult<Self::Connection>;

    /// Lightweight reachability check run before the pool is built.
    async fn probe(&self) -> DbResult<()> {
        let mut conn = self.connect().await?;
        let result = conn.ping().await;
        conn.close().await?;
        result
    }

    /// Human-readable target, safe to log (no credentials).
    fn describe(&self) -> String;
}

/// A single authenticated channel to the database.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    /// Run a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    /// Run a query and map every returned row.
    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    async fn begin(&mut self) -> DbResult<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Trivial round trip used by health checks.
    async fn ping(&mut self) -> DbResult<()> {
        self.query("SELECT 1", &[]).await.map(|_| ())
    }

    /// Close the connection gracefully.
    async fn close(self) -> DbResult<()>;

    /// From now on, JSON columns come back parsed and `QueryParam::Json` is
    /// bound through the driver's JSON type.
    fn register_json_adapter(&mut self);

    fn json_adapter_registered(&self) -> bool;
}
