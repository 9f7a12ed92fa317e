//! sqlx-backed PostgreSQL driver.

use crate::config::{DatabaseConfig, DatabaseSettings};
use crate::db::driver::{Connector, DriverConnection, Row};
use crate::db::types::{bind_param, row_to_json};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use tracing::debug;

/// Opens sqlx connections to one PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    description: String,
}

impl PgConnector {
    /// Build from a `postgres://` URL. Toolkit pool options must already be
    /// stripped from the query string (see [`DatabaseConfig::parse`]).
    pub fn from_url(url: &str) -> DbResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| DbError::configuration(format!("Invalid connection string: {}", e)))?;
        let description = format!(
            "postgres://{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or_default()
        );
        Ok(Self {
            options,
            description,
        })
    }

    pub fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        Self::from_url(&config.connection_string)
    }

    pub fn from_settings(settings: &DatabaseSettings) -> DbResult<Self> {
        Self::from_url(&settings.connection_url()?)
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgDriverConnection;

    async fn connect(&self) -> DbResult<PgDriverConnection> {
        let conn = self.options.connect().await?;
        Ok(PgDriverConnection {
            conn,
            native_json: false,
        })
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// One authenticated PostgreSQL connection.
pub struct PgDriverConnection {
    conn: PgConnection,
    native_json: bool,
}

impl std::fmt::Debug for PgDriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDriverConnection")
            .field("native_json", &self.native_json)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DriverConnection for PgDriverConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        debug!(sql = %sql, params = params.len(), "Executing statement");
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        debug!(sql = %sql, params = params.len(), "Executing query");
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(&mut self.conn).await?;
        rows.iter()
            .map(|row| row_to_json(row, self.native_json))
            .collect()
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await?;
        Ok(())
    }

    fn register_json_adapter(&mut self) {
        self.native_json = true;
    }

    fn json_adapter_registered(&self) -> bool {
        self.native_json
    }
}
