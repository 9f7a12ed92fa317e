//! In-memory driver used by the integration tests.
//!
//! `MockConnector` records every statement, counts opened and closed
//! connections and can be told to fail probes, connects, pings or statements
//! matching a substring.

#![allow(dead_code)]

use async_trait::async_trait;
use pg_toolkit::config::{JsonMode, PoolConfig};
use pg_toolkit::db::driver::{Connector, DriverConnection, Row};
use pg_toolkit::db::{ConnectionPool, RetryPolicy};
use pg_toolkit::error::{DbError, DbResult};
use pg_toolkit::models::QueryParam;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub connection: u64,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

#[derive(Debug, Default)]
pub struct MockState {
    executed: Mutex<Vec<Executed>>,
    probes: Mutex<Vec<Instant>>,
    results: Mutex<VecDeque<Vec<Row>>>,
    failing_sql: Mutex<Vec<String>>,
    hanging_sql: Mutex<Vec<String>>,
    violating_sql: Mutex<Vec<(String, String)>>,
    /// Connects still allowed before every further connect hangs.
    connects_before_hang: Mutex<Option<u32>>,
    /// Remaining probes that fail before one succeeds.
    pub probe_failures: AtomicU32,
    /// Remaining `connect` calls that fail.
    pub connect_failures: AtomicU32,
    pub ping_fails: AtomicBool,
    pub rows_affected: AtomicU64,
    pub opened: AtomicU32,
    pub closed: AtomicU32,
    next_id: AtomicU64,
}

impl MockState {
    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().unwrap().clone()
    }

    /// SQL text of every statement run so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.sql).collect()
    }

    pub fn last(&self) -> Option<Executed> {
        self.executed.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.executed.lock().unwrap().clear();
    }

    pub fn probe_times(&self) -> Vec<Instant> {
        self.probes.lock().unwrap().clone()
    }

    /// Queue the rows returned by the next `query`.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.results.lock().unwrap().push_back(rows);
    }

    /// Statements containing `fragment` fail with a database error.
    pub fn fail_on(&self, fragment: &str) {
        self.failing_sql.lock().unwrap().push(fragment.to_string());
    }

    /// Statements containing `fragment` fail like a unique violation on
    /// `constraint`.
    pub fn violate_on(&self, fragment: &str, constraint: &str) {
        self.violating_sql
            .lock()
            .unwrap()
            .push((fragment.to_string(), constraint.to_string()));
    }

    /// Statements containing `fragment` never complete.
    pub fn hang_on(&self, fragment: &str) {
        self.hanging_sql.lock().unwrap().push(fragment.to_string());
    }

    /// Let `allowed` more connects through, then make every connect hang.
    pub fn hang_connects_after(&self, allowed: u32) {
        *self.connects_before_hang.lock().unwrap() = Some(allowed);
    }

    pub fn stop_hanging_connects(&self) {
        *self.connects_before_hang.lock().unwrap() = None;
    }

    fn connect_hangs(&self) -> bool {
        let mut budget = self.connects_before_hang.lock().unwrap();
        match budget.as_mut() {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    pub fn open_connections(&self) -> u32 {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn run(&self, connection: u64, sql: &str, params: &[QueryParam]) -> DbResult<()> {
        self.executed.lock().unwrap().push(Executed {
            connection,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        let hangs = self.hanging_sql.lock().unwrap().iter().any(|f| sql.contains(f));
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let violated = self
            .violating_sql
            .lock()
            .unwrap()
            .iter()
            .find(|(f, _)| sql.contains(f.as_str()))
            .map(|(_, c)| c.clone());
        if let Some(constraint) = violated {
            return Err(DbError::ConstraintViolation {
                table: None,
                constraint: Some(constraint),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        let fails = self.failing_sql.lock().unwrap().iter().any(|f| sql.contains(f));
        if fails {
            return Err(DbError::database(
                format!("mock failure for: {}", sql),
                Some("XX000".to_string()),
                "",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> DbResult<MockConnection> {
        if self.state.connect_hangs() {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if MockState::take_failure(&self.state.connect_failures) {
            return Err(DbError::connection("mock connect refused", "start the mock"));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            state: Arc::clone(&self.state),
            json_adapter: false,
        })
    }

    async fn probe(&self) -> DbResult<()> {
        self.state.probes.lock().unwrap().push(Instant::now());
        if MockState::take_failure(&self.state.probe_failures) {
            return Err(DbError::connection("mock probe refused", "start the mock"));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock://test".to_string()
    }
}

#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    json_adapter: bool,
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.state.run(self.id, sql, params).await?;
        Ok(self.state.rows_affected.load(Ordering::SeqCst))
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.state.run(self.id, sql, params).await?;
        Ok(self.state.results.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.state.ping_fails.load(Ordering::SeqCst) {
            return Err(DbError::connection("mock ping failed", "restart the mock"));
        }
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_json_adapter(&mut self) {
        self.json_adapter = true;
    }

    fn json_adapter_registered(&self) -> bool {
        self.json_adapter
    }
}

/// Fast retry policy for tests.
pub fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), attempts).max_delay(Duration::from_secs(60))
}

pub fn pool_config(min_size: u32, max_size: u32) -> PoolConfig {
    PoolConfig::new()
        .min_size(min_size)
        .max_size(max_size)
        .acquisition_timeout(Duration::from_secs(5))
        .retry(quick_retry(3))
}

pub fn mock_pool(config: PoolConfig) -> (ConnectionPool<MockConnector>, Arc<MockState>) {
    let connector = MockConnector::new();
    let state = Arc::clone(&connector.state);
    let pool = ConnectionPool::new(connector, config).expect("valid pool config");
    (pool, state)
}

pub fn native_pool() -> (ConnectionPool<MockConnector>, Arc<MockState>) {
    mock_pool(pool_config(1, 2).json_mode(JsonMode::Native))
}

/// Build a result row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
