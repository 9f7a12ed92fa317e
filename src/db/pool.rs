//! Connection pool management.
//!
//! [`ConnectionPool`] owns a bounded set of driver connections. Checked-out
//! connections are bounded by a semaphore with `max_size` permits; the idle
//! deque and the live counter sit behind one mutex that is never held across
//! an await point.
//!
//! A connection is handed out as a [`PooledConnection`]. Call
//! [`PooledConnection::release`] (or [`ConnectionPool::release`]) when done;
//! dropping it also returns it, closing broken connections on a spawned task.

use crate::config::{HealthCheckMode, JsonMode, PoolConfig};
use crate::db::driver::{Connector, DriverConnection, Row};
use crate::db::retry::retry_with_backoff;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionMetadata, PoolStatus, QueryParam};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

type PostInitHook<C> =
    Arc<dyn Fn(ConnectionPool<C>) -> BoxFuture<'static, DbResult<()>> + Send + Sync>;

struct IdleConnection<Conn> {
    conn: Conn,
    meta: ConnectionMetadata,
}

struct PoolState<Conn> {
    idle: VecDeque<IdleConnection<Conn>>,
    /// Idle + checked out + being opened. Never exceeds `max_size`.
    live: u32,
    next_id: u64,
}

/// Outcome of asking the slots for a connection while holding a permit.
enum Claim<Conn> {
    Idle(IdleConnection<Conn>),
    Open(SlotReservation<Conn>),
    Full,
}

/// Counters shared between the pool and every checked-out connection.
struct PoolSlots<Conn> {
    state: Mutex<PoolState<Conn>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    max_size: u32,
}

impl<Conn> PoolSlots<Conn> {
    fn new(max_size: u32) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                next_id: 1,
            }),
            semaphore: Arc::new(Semaphore::new(max_size as usize)),
            closed: AtomicBool::new(false),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<Conn>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reuse an idle connection or reserve room to open a new one.
    fn claim(self: &Arc<Self>) -> Claim<Conn> {
        let mut state = self.lock();
        if let Some(idle) = state.idle.pop_front() {
            return Claim::Idle(idle);
        }
        if state.live >= self.max_size {
            return Claim::Full;
        }
        state.live += 1;
        let id = state.next_id;
        state.next_id += 1;
        Claim::Open(SlotReservation {
            slots: Arc::clone(self),
            id,
            armed: true,
        })
    }

    /// Reserve room without looking at the idle set (used to reach `min_size`).
    fn reserve(self: &Arc<Self>) -> Option<SlotReservation<Conn>> {
        let mut state = self.lock();
        if state.live >= self.max_size {
            return None;
        }
        state.live += 1;
        let id = state.next_id;
        state.next_id += 1;
        Some(SlotReservation {
            slots: Arc::clone(self),
            id,
            armed: true,
        })
    }

    fn take_idle(&self) -> Option<IdleConnection<Conn>> {
        self.lock().idle.pop_front()
    }

    fn forget(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
    }

    /// Put a connection back, or hand it back to the caller for closing when
    /// it must not be reused.
    fn check_in(&self, conn: Conn, mut meta: ConnectionMetadata, discard: bool) -> Option<Conn> {
        let mut state = self.lock();
        if discard || self.is_closed() {
            state.live = state.live.saturating_sub(1);
            return Some(conn);
        }
        meta.mark_checkin();
        state.idle.push_back(IdleConnection { conn, meta });
        None
    }

    fn drain_idle(&self) -> Vec<IdleConnection<Conn>> {
        let mut state = self.lock();
        let drained: Vec<_> = state.idle.drain(..).collect();
        state.live = state.live.saturating_sub(drained.len() as u32);
        drained
    }
}

/// A slot counted in `live` for a connection that is still being opened.
/// Dropping it unused (failed or cancelled connect) gives the slot back.
struct SlotReservation<Conn> {
    slots: Arc<PoolSlots<Conn>>,
    id: u64,
    armed: bool,
}

impl<Conn> SlotReservation<Conn> {
    fn commit(mut self) -> u64 {
        self.armed = false;
        self.id
    }
}

impl<Conn> Drop for SlotReservation<Conn> {
    fn drop(&mut self) {
        if self.armed {
            self.slots.forget();
        }
    }
}

async fn with_statement_timeout<T>(
    limit: Option<Duration>,
    sql: &str,
    fut: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(statement_label(sql), limit)),
        },
        None => fut.await,
    }
}

fn statement_label(sql: &str) -> String {
    match sql.split_whitespace().next() {
        Some(verb) => format!("{} statement", verb.to_ascii_uppercase()),
        None => "statement".to_string(),
    }
}

/// Connections opened during initialization but not yet in the idle set.
/// If initialization is cancelled or fails first, dropping the batch gives
/// their slots back and closes them.
struct OpenedBatch<Conn: DriverConnection> {
    slots: Arc<PoolSlots<Conn>>,
    conns: Vec<IdleConnection<Conn>>,
}

impl<Conn: DriverConnection> OpenedBatch<Conn> {
    fn new(slots: &Arc<PoolSlots<Conn>>) -> Self {
        Self {
            slots: Arc::clone(slots),
            conns: Vec::new(),
        }
    }

    /// Move the batch into the idle set.
    fn commit(mut self) {
        let conns = std::mem::take(&mut self.conns);
        self.slots.lock().idle.extend(conns);
    }
}

impl<Conn: DriverConnection> Drop for OpenedBatch<Conn> {
    fn drop(&mut self) {
        if self.conns.is_empty() {
            return;
        }
        for _ in &self.conns {
            self.slots.forget();
        }
        let conns = std::mem::take(&mut self.conns);
        debug!(count = conns.len(), "Discarding connections from an unfinished initialization");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for idle in conns {
                    if let Err(e) = idle.conn.close().await {
                        debug!(connection_id = idle.meta.id, error = %e, "Error closing connection");
                    }
                }
            });
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Exactly one caller owns it until it is released. Statements are bounded by
/// the pool's statement timeout; a timeout or a connection-level failure marks
/// it broken so it is discarded instead of reused.
pub struct PooledConnection<Conn: DriverConnection> {
    conn: Option<Conn>,
    meta: ConnectionMetadata,
    slots: Arc<PoolSlots<Conn>>,
    permit: Option<OwnedSemaphorePermit>,
    statement_timeout: Option<Duration>,
    in_transaction: bool,
}

impl<Conn: DriverConnection> std::fmt::Debug for PooledConnection<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("state", &self.meta.state)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl<Conn: DriverConnection> PooledConnection<Conn> {
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    pub fn is_broken(&self) -> bool {
        self.meta.is_broken()
    }

    /// Flag the connection so release discards it.
    pub fn mark_broken(&mut self) {
        if !self.meta.is_broken() {
            debug!(connection_id = self.meta.id, "Marking connection broken");
        }
        self.meta.mark_broken();
    }

    /// True between a successful BEGIN and the matching COMMIT/ROLLBACK.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn json_adapter_registered(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|c| c.json_adapter_registered())
    }

    fn driver(&mut self) -> DbResult<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("connection used after release"))
    }

    fn observe<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                warn!(connection_id = self.meta.id, error = %e, "Connection failure");
                self.mark_broken();
            }
        }
        result
    }

    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, sql, conn.execute(sql, params)).await;
        self.observe(result)
    }

    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, sql, conn.query(sql, params)).await;
        self.observe(result)
    }

    /// Run a query expected to return at most one row.
    pub async fn query_opt(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, "SELECT 1", conn.ping()).await;
        self.observe(result)
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, "BEGIN", conn.begin()).await;
        let result = self.observe(result);
        if result.is_ok() {
            self.in_transaction = true;
        }
        result
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, "COMMIT", conn.commit()).await;
        // Postgres ends the transaction whether COMMIT succeeds or not.
        self.in_transaction = false;
        self.observe(result)
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        let limit = self.statement_timeout;
        let conn = self.driver()?;
        let result = with_statement_timeout(limit, "ROLLBACK", conn.rollback()).await;
        match result {
            Ok(()) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                // Transaction state on the server is unknown now.
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Return the connection to its pool.
    pub async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = self.meta.id;
        if let Some(conn) = self.check_in(conn) {
            if let Err(e) = conn.close().await {
                debug!(connection_id = id, error = %e, "Error closing discarded connection");
            }
        }
        self.permit.take();
    }

    fn check_in(&mut self, conn: Conn) -> Option<Conn> {
        if self.in_transaction {
            warn!(
                connection_id = self.meta.id,
                "Connection released inside an open transaction; discarding"
            );
        }
        let discard = self.meta.is_broken() || self.in_transaction;
        let to_close = self.slots.check_in(conn, self.meta.clone(), discard);
        if to_close.is_some() {
            debug!(connection_id = self.meta.id, "Discarding connection");
        }
        to_close
    }
}

impl<Conn: DriverConnection> Drop for PooledConnection<Conn> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Some(conn) = self.check_in(conn) {
                // Closing is async; without a runtime the socket just drops.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let id = self.meta.id;
                    handle.spawn(async move {
                        if let Err(e) = conn.close().await {
                            debug!(connection_id = id, error = %e, "Error closing discarded connection");
                        }
                    });
                }
            }
        }
        // The permit goes last so a waiter always finds the returned connection.
        self.permit.take();
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: Arc<PoolSlots<C::Connection>>,
    init: OnceCell<()>,
    /// Set once `min_size` is reached and every post-init hook succeeded.
    ready: AtomicBool,
    hooks: Mutex<Vec<PostInitHook<C>>>,
}

/// Bounded pool of driver connections. Cheap to clone; clones share the pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
    /// Handle given to post-init hooks: acquires skip the readiness check.
    in_init_hook: bool,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            in_init_hook: self.in_init_hook,
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.connector.describe())
            .field("status", &self.status())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an uninitialized pool. No connection is opened until
    /// [`initialize`](Self::initialize) or the first acquire.
    pub fn new(connector: C, config: PoolConfig) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                slots: Arc::new(PoolSlots::new(config.max_size)),
                connector,
                config,
                init: OnceCell::new(),
                ready: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
            in_init_hook: false,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Whether connections carry the driver's native JSON adapter.
    pub fn json_mode(&self) -> JsonMode {
        self.inner.config.json_mode
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.slots.lock();
        let idle = state.idle.len() as u32;
        PoolStatus {
            live: state.live,
            idle,
            in_use: state.live.saturating_sub(idle),
            min_size: self.inner.config.min_size,
            max_size: self.inner.config.max_size,
            initialized: self.is_initialized(),
            closed: self.is_closed(),
        }
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<PostInitHook<C>>> {
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback run once, in registration order, right after the
    /// pool reaches `min_size`. A failing hook aborts initialization.
    ///
    /// Hooks may acquire connections from the pool handle they receive but
    /// must not call `initialize` on it.
    pub fn register_post_init_hook<F, Fut>(&self, hook: F) -> DbResult<()>
    where
        F: Fn(ConnectionPool<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        if self.inner.init.initialized() {
            return Err(DbError::configuration(
                "post-init hooks must be registered before the pool is initialized",
            ));
        }
        let hook: PostInitHook<C> =
            Arc::new(move |pool| -> BoxFuture<'static, DbResult<()>> { Box::pin(hook(pool)) });
        self.lock_hooks().push(hook);
        Ok(())
    }

    /// Build the pool. Idempotent: concurrent and repeated calls share one
    /// successful initialization. A failed attempt leaves the pool
    /// uninitialized so a later call can try again.
    pub async fn initialize(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        self.inner.init.get_or_try_init(|| self.build()).await?;
        Ok(())
    }

    async fn build(&self) -> DbResult<()> {
        let config = &self.inner.config;
        info!(
            target_db = %self.inner.connector.describe(),
            min_size = config.min_size,
            max_size = config.max_size,
            json_mode = %config.json_mode,
            "Initializing connection pool"
        );

        let connector = &self.inner.connector;
        retry_with_backoff(&config.retry, "connectivity probe", move || connector.probe()).await?;

        // Connections kept from an attempt cancelled during its hooks count
        // towards min_size.
        let live = self.inner.slots.lock().live;
        let mut opened = OpenedBatch::new(&self.inner.slots);
        for _ in live..config.min_size {
            let Some(reservation) = self.inner.slots.reserve() else {
                break;
            };
            match self.open(reservation).await {
                Ok(idle) => opened.conns.push(idle),
                Err(e) => {
                    error!(error = %e, "Failed to open initial connections");
                    return Err(e);
                }
            }
        }
        opened.commit();

        let hook_pool = Self {
            inner: Arc::clone(&self.inner),
            in_init_hook: true,
        };
        let hooks = self.lock_hooks().clone();
        for (index, hook) in hooks.iter().enumerate() {
            debug!(hook = index, "Running post-init hook");
            if let Err(e) = hook(hook_pool.clone()).await {
                error!(hook = index, error = %e, "Post-init hook failed, aborting initialization");
                for idle in self.inner.slots.drain_idle() {
                    let _ = idle.conn.close().await;
                }
                return Err(e);
            }
        }
        self.inner.ready.store(true, Ordering::SeqCst);

        info!(status = %self.status(), "Connection pool ready");
        Ok(())
    }

    async fn open(
        &self,
        reservation: SlotReservation<C::Connection>,
    ) -> DbResult<IdleConnection<C::Connection>> {
        let mut conn = self.inner.connector.connect().await?;
        if self.inner.config.json_mode.is_native() {
            conn.register_json_adapter();
        }
        let id = reservation.commit();
        debug!(connection_id = id, "Opened connection");
        Ok(IdleConnection {
            conn,
            meta: ConnectionMetadata::new(id),
        })
    }

    fn wrap(
        &self,
        idle: IdleConnection<C::Connection>,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<C::Connection> {
        PooledConnection {
            conn: Some(idle.conn),
            meta: idle.meta,
            slots: Arc::clone(&self.inner.slots),
            permit: Some(permit),
            statement_timeout: self.inner.config.statement_timeout,
            in_transaction: false,
        }
    }

    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
    ) -> DbResult<PooledConnection<C::Connection>> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        let mut idle = match self.inner.slots.claim() {
            Claim::Idle(idle) => idle,
            Claim::Open(reservation) => self.open(reservation).await?,
            Claim::Full => return Err(DbError::pool_exhausted(self.inner.config.max_size)),
        };
        idle.meta.mark_checkout();
        debug!(connection_id = idle.meta.id, "Connection checked out");
        Ok(self.wrap(idle, permit))
    }

    async fn ensure_initialized(&self) -> DbResult<()> {
        if self.in_init_hook || self.is_initialized() {
            return Ok(());
        }
        self.initialize().await
    }

    /// Check out a connection, waiting up to `acquisition_timeout` for one to
    /// become available. A zero timeout behaves like [`try_acquire`](Self::try_acquire).
    pub async fn acquire(&self) -> DbResult<PooledConnection<C::Connection>> {
        self.ensure_initialized().await?;
        let limit = self.inner.config.acquisition_timeout;
        if limit.is_zero() {
            return self.try_acquire().await;
        }

        let semaphore = Arc::clone(&self.inner.slots.semaphore);
        let attempt = async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| DbError::PoolClosed)?;
            self.checkout(permit).await
        };
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    status = %self.status(),
                    "Timed out waiting for a connection"
                );
                Err(DbError::pool_timeout(limit))
            }
        }
    }

    /// Check out a connection without waiting; fails with `PoolExhausted`
    /// when all `max_size` connections are in use.
    pub async fn try_acquire(&self) -> DbResult<PooledConnection<C::Connection>> {
        self.ensure_initialized().await?;
        let permit = match Arc::clone(&self.inner.slots.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(DbError::pool_exhausted(self.inner.config.max_size));
            }
            Err(TryAcquireError::Closed) => return Err(DbError::PoolClosed),
        };
        self.checkout(permit).await
    }

    /// Return a connection to the idle set (or discard it if broken).
    pub async fn release(&self, conn: PooledConnection<C::Connection>) {
        conn.release().await;
    }

    /// Run `SELECT 1` against one connection or every idle connection,
    /// depending on [`HealthCheckMode`]. Connections that fail are marked
    /// broken and discarded; healthy ones go back untouched.
    pub async fn health_check(&self) -> bool {
        let healthy = match self.inner.config.health_check {
            HealthCheckMode::One => self.check_one().await,
            HealthCheckMode::All => self.check_all().await,
        };
        if healthy {
            debug!("Pool health check passed");
        } else {
            warn!(status = %self.status(), "Pool health check failed");
        }
        healthy
    }

    async fn probe_connection(conn: &mut PooledConnection<C::Connection>) -> bool {
        match conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection_id = conn.id(), error = %e, "Health probe failed");
                conn.mark_broken();
                false
            }
        }
    }

    /// Probe one connection without queueing behind other callers. A pool
    /// with every connection checked out is busy, not unhealthy.
    async fn check_one(&self) -> bool {
        let mut conn = match self.try_acquire().await {
            Ok(conn) => conn,
            Err(DbError::PoolExhausted { .. }) => {
                debug!("Health check skipped: every connection is in use");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "Health check could not acquire a connection");
                return false;
            }
        };
        let healthy = Self::probe_connection(&mut conn).await;
        conn.release().await;
        healthy
    }

    async fn check_all(&self) -> bool {
        if let Err(e) = self.ensure_initialized().await {
            warn!(error = %e, "Health check could not initialize the pool");
            return false;
        }
        let mut checked = Vec::new();
        let mut healthy = true;
        loop {
            let Ok(permit) = Arc::clone(&self.inner.slots.semaphore).try_acquire_owned() else {
                break;
            };
            let Some(idle) = self.inner.slots.take_idle() else {
                break;
            };
            let mut conn = self.wrap(idle, permit);
            healthy &= Self::probe_connection(&mut conn).await;
            checked.push(conn);
        }
        if checked.is_empty() {
            return self.check_one().await;
        }
        for conn in checked {
            conn.release().await;
        }
        healthy
    }

    /// Close every idle connection and refuse further acquires. Connections
    /// still checked out are closed when released. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.slots.closed.swap(true, Ordering::SeqCst) {
            debug!("Connection pool already shut down");
            return;
        }
        self.inner.slots.semaphore.close();
        self.inner.ready.store(false, Ordering::SeqCst);

        let drained = self.inner.slots.drain_idle();
        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.conn.close().await {
                debug!(connection_id = idle.meta.id, error = %e, "Error closing connection");
            }
        }
        info!(closed = count, "Connection pool shut down");
    }
}
