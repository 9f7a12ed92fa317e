//! Transactions, savepoints and schema/data lifecycles.
//!
//! A [`TransactionScope`] owns one pooled connection and a stack of frames.
//! The outermost frame is a real `BEGIN`/`COMMIT`/`ROLLBACK`; every frame
//! pushed on top of it is a savepoint. Closure-based entry points commit when
//! the body returns `Ok` and roll back when it returns `Err`, handing the
//! body's error back unchanged.
//!
//! ```rust,ignore
//! let manager = pool.transaction_manager();
//! manager
//!     .transaction(|scope| {
//!         Box::pin(async move {
//!             repo.create(scope.connection(), &order).await?;
//!             // Runs inside SAVEPOINT sp_1
//!             scope
//!                 .transaction(|inner| Box::pin(async move { audit(inner).await }))
//!                 .await
//!         })
//!     })
//!     .await?;
//! ```

use crate::db::driver::{Connector, DriverConnection};
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::db::sql::validate_identifier;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::marker::PhantomData;
use tracing::{debug, error, warn};

/// Creates and drops schema objects around a unit of work.
#[async_trait]
pub trait SchemaManager<Conn: DriverConnection>: Send + Sync {
    /// Value handed to the body, e.g. the name of a created schema.
    type Context: Send + Sync;

    async fn create_schema(&self, conn: &mut PooledConnection<Conn>) -> DbResult<Self::Context>;

    async fn drop_schema(&self, conn: &mut PooledConnection<Conn>) -> DbResult<()>;
}

/// Seeds and removes data around a unit of work.
#[async_trait]
pub trait DataManager<Conn: DriverConnection>: Send + Sync {
    type Context: Send + Sync;

    async fn setup_data(&self, conn: &mut PooledConnection<Conn>) -> DbResult<Self::Context>;

    async fn cleanup_data(&self, conn: &mut PooledConnection<Conn>) -> DbResult<()>;
}

/// Schema manager that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

#[async_trait]
impl<Conn: DriverConnection> SchemaManager<Conn> for NoSchema {
    type Context = ();

    async fn create_schema(&self, _conn: &mut PooledConnection<Conn>) -> DbResult<()> {
        Ok(())
    }

    async fn drop_schema(&self, _conn: &mut PooledConnection<Conn>) -> DbResult<()> {
        Ok(())
    }
}

/// Data manager that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoData;

#[async_trait]
impl<Conn: DriverConnection> DataManager<Conn> for NoData {
    type Context = ();

    async fn setup_data(&self, _conn: &mut PooledConnection<Conn>) -> DbResult<()> {
        Ok(())
    }

    async fn cleanup_data(&self, _conn: &mut PooledConnection<Conn>) -> DbResult<()> {
        Ok(())
    }
}

/// Contexts produced by the schema and data managers of a
/// [`managed_transaction`](TransactionScope::managed_transaction).
#[derive(Debug)]
pub struct ManagedContext<'a, S, D> {
    pub schema: &'a S,
    pub data: &'a D,
}

impl<S, D> Clone for ManagedContext<'_, S, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, D> Copy for ManagedContext<'_, S, D> {}

/// Where a scope is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// No transaction open.
    Idle,
    Active,
    Committing,
    RollingBack,
    /// The outermost transaction ended. A new `begin` starts another one.
    Closed,
}

#[derive(Debug)]
struct Frame {
    id: u64,
    /// `None` for the outermost frame.
    savepoint: Option<String>,
}

/// Combine a body result with its teardown result. The body's error wins;
/// when both fail the caller sees both.
fn settle<T>(result: DbResult<T>, teardown: DbResult<()>, step: &str) -> DbResult<T> {
    match (result, teardown) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => {
            error!(step, error = %cleanup, "Teardown failed after successful body");
            Err(cleanup)
        }
        (Err(original), Ok(())) => Err(original),
        (Err(original), Err(cleanup)) => {
            error!(step, error = %cleanup, original = %original, "Teardown failed after body error");
            Err(DbError::cleanup_failed(original, cleanup))
        }
    }
}

/// A connection with transaction and savepoint bookkeeping.
///
/// `'env` bounds what body closures may borrow: a closure passed to
/// [`transaction`](Self::transaction) can capture references that outlive the
/// scope itself, such as a repository declared before the transaction.
pub struct TransactionScope<'env, Conn: DriverConnection> {
    conn: PooledConnection<Conn>,
    frames: Vec<Frame>,
    next_frame_id: u64,
    savepoint_counter: u64,
    state: ScopeState,
    _env: PhantomData<&'env ()>,
}

impl<Conn: DriverConnection> std::fmt::Debug for TransactionScope<'_, Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("connection_id", &self.conn.id())
            .field("depth", &self.depth())
            .field("state", &self.state)
            .field("savepoints", &self.savepoints())
            .finish()
    }
}

impl<'env, Conn: DriverConnection> TransactionScope<'env, Conn> {
    pub fn new(conn: PooledConnection<Conn>) -> Self {
        Self {
            conn,
            frames: Vec::new(),
            next_frame_id: 0,
            savepoint_counter: 0,
            state: ScopeState::Idle,
            _env: PhantomData,
        }
    }

    /// The connection every statement of this scope runs on.
    pub fn connection(&mut self) -> &mut PooledConnection<Conn> {
        &mut self.conn
    }

    /// Number of open frames; 0 outside any transaction.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Names of the open savepoints, outermost first.
    pub fn savepoints(&self) -> Vec<&str> {
        self.frames
            .iter()
            .filter_map(|frame| frame.savepoint.as_deref())
            .collect()
    }

    fn next_savepoint_name(&mut self, label: Option<&str>) -> DbResult<String> {
        self.savepoint_counter += 1;
        let name = match label {
            Some(label) => format!("{}_{}", label, self.savepoint_counter),
            None => format!("sp_{}", self.savepoint_counter),
        };
        validate_identifier(&name)?;
        Ok(name)
    }

    async fn open_frame(&mut self, label: Option<&str>) -> DbResult<u64> {
        if let Some(label) = label {
            validate_identifier(label)?;
        }
        let savepoint = if self.frames.is_empty() {
            self.conn.begin().await?;
            self.state = ScopeState::Active;
            debug!(connection_id = self.conn.id(), "Transaction started");
            None
        } else {
            let name = self.next_savepoint_name(label)?;
            self.conn
                .execute(&format!("SAVEPOINT {}", name), &[])
                .await?;
            debug!(connection_id = self.conn.id(), savepoint = %name, "Savepoint created");
            Some(name)
        };
        self.next_frame_id += 1;
        let id = self.next_frame_id;
        self.frames.push(Frame { id, savepoint });
        Ok(id)
    }

    /// Open a frame: `BEGIN` at depth 0, `SAVEPOINT sp_<n>` otherwise.
    pub async fn begin(&mut self) -> DbResult<()> {
        self.open_frame(None).await.map(|_| ())
    }

    /// Like [`begin`](Self::begin); a nested frame's savepoint is named
    /// `<label>_<n>`.
    pub async fn begin_labeled(&mut self, label: &str) -> DbResult<()> {
        self.open_frame(Some(label)).await.map(|_| ())
    }

    /// Close the innermost frame successfully: `COMMIT` or `RELEASE SAVEPOINT`.
    pub async fn commit(&mut self) -> DbResult<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| DbError::invalid_input("commit called with no open transaction"))?;
        match frame.savepoint {
            None => {
                self.state = ScopeState::Committing;
                let result = self.conn.commit().await;
                self.state = ScopeState::Closed;
                match result {
                    Ok(()) => {
                        debug!(connection_id = self.conn.id(), "Transaction committed");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(connection_id = self.conn.id(), error = %e, "Commit failed");
                        Err(DbError::transaction_aborted(e, None))
                    }
                }
            }
            Some(name) => {
                let result = self
                    .conn
                    .execute(&format!("RELEASE SAVEPOINT {}", name), &[])
                    .await;
                match result {
                    Ok(_) => {
                        debug!(connection_id = self.conn.id(), savepoint = %name, "Savepoint released");
                        Ok(())
                    }
                    Err(e) => Err(DbError::transaction_aborted(e, Some(name))),
                }
            }
        }
    }

    /// Close the innermost frame unsuccessfully: `ROLLBACK` or
    /// `ROLLBACK TO SAVEPOINT`. A failed rollback marks the connection broken.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| DbError::invalid_input("rollback called with no open transaction"))?;
        match frame.savepoint {
            None => {
                self.state = ScopeState::RollingBack;
                let result = self.conn.rollback().await;
                self.state = ScopeState::Closed;
                if result.is_ok() {
                    debug!(connection_id = self.conn.id(), "Transaction rolled back");
                }
                result
            }
            Some(name) => {
                let rolled_back = self
                    .conn
                    .execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
                    .await;
                let result = match rolled_back {
                    Ok(_) => self
                        .conn
                        .execute(&format!("RELEASE SAVEPOINT {}", name), &[])
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        debug!(connection_id = self.conn.id(), savepoint = %name, "Rolled back to savepoint");
                        Ok(())
                    }
                    Err(e) => {
                        self.conn.mark_broken();
                        Err(e)
                    }
                }
            }
        }
    }

    async fn close_frame<T>(&mut self, frame_id: u64, result: DbResult<T>) -> DbResult<T> {
        let Some(position) = self.frames.iter().position(|f| f.id == frame_id) else {
            // The body closed its own frame explicitly.
            return result;
        };
        while self.frames.len() > position + 1 {
            warn!(
                connection_id = self.conn.id(),
                depth = self.frames.len(),
                "Nested frame left open by body; rolling it back"
            );
            if let Err(e) = self.rollback().await {
                error!(connection_id = self.conn.id(), error = %e, "Rollback of abandoned frame failed");
            }
        }
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(original) => {
                if let Err(e) = self.rollback().await {
                    error!(
                        connection_id = self.conn.id(),
                        error = %e,
                        original = %original,
                        "Rollback failed; connection will be discarded"
                    );
                    self.conn.mark_broken();
                }
                Err(original)
            }
        }
    }

    /// Run `f` in a new frame. Depth 0 opens a real transaction; any deeper
    /// call runs in a savepoint.
    pub async fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<'env, Conn>) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let frame = self.open_frame(None).await?;
        let result = f(&mut *self).await;
        self.close_frame(frame, result).await
    }

    /// [`transaction`](Self::transaction) with a labeled savepoint.
    pub async fn transaction_labeled<T, F>(&mut self, label: &str, f: F) -> DbResult<T>
    where
        F: for<'s> FnOnce(&'s mut TransactionScope<'env, Conn>) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let frame = self.open_frame(Some(label)).await?;
        let result = f(&mut *self).await;
        self.close_frame(frame, result).await
    }

    async fn drop_schema_best_effort<S>(&mut self, schema: &S)
    where
        S: SchemaManager<Conn> + ?Sized,
    {
        if let Err(e) = schema.drop_schema(&mut self.conn).await {
            warn!(connection_id = self.conn.id(), error = %e, "Best-effort schema drop failed");
        }
    }

    async fn cleanup_data_best_effort<D>(&mut self, data: &D)
    where
        D: DataManager<Conn> + ?Sized,
    {
        if let Err(e) = data.cleanup_data(&mut self.conn).await {
            warn!(connection_id = self.conn.id(), error = %e, "Best-effort data cleanup failed");
        }
    }

    /// Create the schema, run `f`, then drop the schema exactly once.
    pub async fn with_schema<S, T, F>(&mut self, schema: &S, f: F) -> DbResult<T>
    where
        S: SchemaManager<Conn> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, Conn>,
                &'s S::Context,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let context = match schema.create_schema(&mut self.conn).await {
            Ok(context) => context,
            Err(e) => {
                self.drop_schema_best_effort(schema).await;
                return Err(e);
            }
        };
        let result = f(&mut *self, &context).await;
        let teardown = schema.drop_schema(&mut self.conn).await;
        settle(result, teardown, "drop_schema")
    }

    /// Set up data, run `f`, then clean the data up exactly once.
    pub async fn with_data<D, T, F>(&mut self, data: &D, f: F) -> DbResult<T>
    where
        D: DataManager<Conn> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, Conn>,
                &'s D::Context,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let context = match data.setup_data(&mut self.conn).await {
            Ok(context) => context,
            Err(e) => {
                self.cleanup_data_best_effort(data).await;
                return Err(e);
            }
        };
        let result = f(&mut *self, &context).await;
        let teardown = data.cleanup_data(&mut self.conn).await;
        settle(result, teardown, "cleanup_data")
    }

    /// Schema setup, data setup, `f` in a transaction, data teardown, schema
    /// teardown. Teardown runs in reverse order even when an earlier step
    /// failed.
    pub async fn managed_transaction<S, D, T, F>(
        &mut self,
        schema: &S,
        data: &D,
        f: F,
    ) -> DbResult<T>
    where
        S: SchemaManager<Conn> + ?Sized,
        D: DataManager<Conn> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, Conn>,
                ManagedContext<'s, S::Context, D::Context>,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let schema_context = match schema.create_schema(&mut self.conn).await {
            Ok(context) => context,
            Err(e) => {
                self.drop_schema_best_effort(schema).await;
                return Err(e);
            }
        };
        let data_context = match data.setup_data(&mut self.conn).await {
            Ok(context) => context,
            Err(e) => {
                self.cleanup_data_best_effort(data).await;
                let teardown = schema.drop_schema(&mut self.conn).await;
                return settle(Err(e), teardown, "drop_schema");
            }
        };

        let result = match self.open_frame(None).await {
            Ok(frame) => {
                let context = ManagedContext {
                    schema: &schema_context,
                    data: &data_context,
                };
                let result = f(&mut *self, context).await;
                self.close_frame(frame, result).await
            }
            Err(e) => Err(e),
        };

        let teardown = data.cleanup_data(&mut self.conn).await;
        let result = settle(result, teardown, "cleanup_data");
        let teardown = schema.drop_schema(&mut self.conn).await;
        settle(result, teardown, "drop_schema")
    }

    /// Roll back anything still open and hand the connection back.
    pub async fn into_connection(mut self) -> PooledConnection<Conn> {
        self.unwind().await;
        self.conn
    }

    async fn unwind(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        warn!(
            connection_id = self.conn.id(),
            depth = self.frames.len(),
            "Scope finished with open transaction; rolling back"
        );
        while !self.frames.is_empty() {
            if let Err(e) = self.rollback().await {
                error!(connection_id = self.conn.id(), error = %e, "Rollback during unwind failed");
                self.conn.mark_broken();
                self.frames.clear();
            }
        }
    }

    /// Roll back anything still open and return the connection to its pool.
    pub async fn release(self) {
        self.into_connection().await.release().await;
    }
}

/// Hands out [`TransactionScope`]s backed by a pool.
pub struct TransactionManager<C: Connector> {
    pool: ConnectionPool<C>,
}

impl<C: Connector> Clone for TransactionManager<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<C: Connector> TransactionManager<C> {
    pub fn new(pool: ConnectionPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Acquire a connection wrapped in an idle scope. The caller drives
    /// `begin`/`commit`/`rollback` and calls [`TransactionScope::release`].
    pub async fn scope<'env>(&self) -> DbResult<TransactionScope<'env, C::Connection>> {
        Ok(TransactionScope::new(self.pool.acquire().await?))
    }

    /// Acquire, run `f` in a transaction, release.
    pub async fn transaction<'env, T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, C::Connection>,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let mut scope = self.scope().await?;
        let result = scope.transaction(f).await;
        scope.release().await;
        result
    }

    /// Acquire, create the schema, run `f`, drop the schema, release.
    pub async fn with_schema<'env, S, T, F>(&self, schema: &S, f: F) -> DbResult<T>
    where
        S: SchemaManager<C::Connection> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, C::Connection>,
                &'s S::Context,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let mut scope = self.scope().await?;
        let result = scope.with_schema(schema, f).await;
        scope.release().await;
        result
    }

    /// Acquire, set up data, run `f`, clean up, release.
    pub async fn with_data<'env, D, T, F>(&self, data: &D, f: F) -> DbResult<T>
    where
        D: DataManager<C::Connection> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, C::Connection>,
                &'s D::Context,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let mut scope = self.scope().await?;
        let result = scope.with_data(data, f).await;
        scope.release().await;
        result
    }

    /// Acquire and run [`TransactionScope::managed_transaction`]. Pass
    /// [`NoSchema`] or [`NoData`] for a missing manager.
    pub async fn managed_transaction<'env, S, D, T, F>(
        &self,
        schema: &S,
        data: &D,
        f: F,
    ) -> DbResult<T>
    where
        S: SchemaManager<C::Connection> + ?Sized,
        D: DataManager<C::Connection> + ?Sized,
        F: for<'s> FnOnce(
                &'s mut TransactionScope<'env, C::Connection>,
                ManagedContext<'s, S::Context, D::Context>,
            ) -> BoxFuture<'s, DbResult<T>>
            + Send,
        T: Send,
    {
        let mut scope = self.scope().await?;
        let result = scope.managed_transaction(schema, data, f).await;
        scope.release().await;
        result
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn transaction_manager(&self) -> TransactionManager<C> {
        TransactionManager::new(self.clone())
    }
}
