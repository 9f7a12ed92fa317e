//! Integration tests for the connection pool, run against the mock driver.

mod support;

use pg_toolkit::config::{HealthCheckMode, PoolConfig};
use pg_toolkit::db::RetryPolicy;
use pg_toolkit::error::DbError;
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{mock_pool, pool_config, quick_retry};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_initialize_opens_min_size() {
    let (pool, state) = mock_pool(pool_config(3, 5));
    assert!(!pool.is_initialized());

    assert_ok!(pool.initialize().await);

    let status = pool.status();
    assert!(status.initialized);
    assert_eq!(status.idle, 3);
    assert_eq!(status.live, 3);
    assert_eq!(state.opened.load(Ordering::SeqCst), 3);
    assert_eq!(state.probe_times().len(), 1);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (pool, state) = mock_pool(pool_config(2, 4));

    let (a, b) = tokio::join!(pool.initialize(), pool.initialize());
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(pool.initialize().await);

    assert_eq!(state.probe_times().len(), 1);
    assert_eq!(state.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_probe_retries_with_increasing_delays() {
    let config = pool_config(1, 2).retry(
        RetryPolicy::new(Duration::from_millis(100), 5).max_delay(Duration::from_secs(60)),
    );
    let (pool, state) = mock_pool(config);
    state.probe_failures.store(3, Ordering::SeqCst);

    assert_ok!(pool.initialize().await);

    let probes = state.probe_times();
    assert_eq!(probes.len(), 4);
    let gaps: Vec<Duration> = probes.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(100));
    assert!(gaps[1] >= Duration::from_millis(200));
    assert!(gaps[2] >= Duration::from_millis(400));
    assert!(gaps.windows(2).all(|w| w[1] > w[0]));
}

#[tokio::test(start_paused = true)]
async fn test_probe_gives_up_after_max_attempts() {
    let (pool, state) = mock_pool(pool_config(1, 2).retry(quick_retry(3)));
    state.probe_failures.store(u32::MAX, Ordering::SeqCst);

    match pool.initialize().await {
        Err(DbError::ConnectionUnavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected ConnectionUnavailable, got {other:?}"),
    }
    assert_eq!(state.probe_times().len(), 3);
    assert!(!pool.is_initialized());
    assert_eq!(state.opened.load(Ordering::SeqCst), 0);

    // A later call starts over.
    state.probe_failures.store(0, Ordering::SeqCst);
    assert_ok!(pool.initialize().await);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let config = pool_config(2, 2).acquisition_timeout(Duration::from_millis(50));
    let (pool, _state) = mock_pool(config);
    assert_ok!(pool.initialize().await);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();

    let started = std::time::Instant::now();
    match pool.acquire().await {
        Err(DbError::PoolTimeout { timeout_ms }) => assert_eq!(timeout_ms, 50),
        other => panic!("expected PoolTimeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(50));

    first.release().await;
    let third = assert_ok!(pool.acquire().await);
    third.release().await;
    second.release().await;
}

#[tokio::test]
async fn test_zero_timeout_fails_immediately() {
    let config = pool_config(1, 1).acquisition_timeout(Duration::ZERO);
    let (pool, _state) = mock_pool(config);

    let held = pool.acquire().await.unwrap();
    match pool.acquire().await {
        Err(DbError::PoolExhausted { max_size }) => assert_eq!(max_size, 1),
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    drop(held);
    assert_ok!(pool.try_acquire().await);
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let (pool, state) = mock_pool(pool_config(1, 1));
    let held = pool.acquire().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.release(held).await;

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    assert_eq!(state.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_never_exceeds_max_size() {
    const MAX: u32 = 3;
    let (pool, state) = mock_pool(pool_config(0, MAX));
    let in_use = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..24 {
        let pool = pool.clone();
        let in_use = Arc::clone(&in_use);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let hold = rand::thread_rng().gen_range(1..8u64);
            tokio::time::sleep(Duration::from_millis(hold)).await;
            in_use.fetch_sub(1, Ordering::SeqCst);
            conn.release().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert!(state.opened.load(Ordering::SeqCst) <= MAX);
    assert!(pool.status().live <= MAX);
    assert_eq!(pool.status().in_use, 0);
}

#[tokio::test]
async fn test_post_init_hooks_run_in_order() {
    let (pool, _state) = mock_pool(pool_config(1, 2));
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        pool.register_post_init_hook(move |pool| {
            let order = Arc::clone(&order);
            async move {
                // Hooks run after min_size is reached and may use the pool.
                let conn = pool.acquire().await?;
                conn.release().await;
                order.lock().unwrap().push(name);
                Ok(())
            }
        })
        .unwrap();
    }

    assert_ok!(pool.initialize().await);
    assert_ok!(pool.initialize().await);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);

    let late = pool.register_post_init_hook(|_| async { Ok(()) });
    assert!(matches!(late, Err(DbError::Configuration { .. })));
}

#[tokio::test]
async fn test_failing_hook_aborts_initialization() {
    let (pool, state) = mock_pool(pool_config(2, 2));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        pool.register_post_init_hook(move |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DbError::operation("migrate", "boom"))
            }
        })
        .unwrap();
    }

    assert_err!(pool.initialize().await);
    assert!(!pool.is_initialized());
    assert_eq!(pool.status().live, 0);
    assert_eq!(state.open_connections(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_initialize_gives_back_opened_slots() {
    let (pool, state) = mock_pool(pool_config(2, 2));
    state.hang_connects_after(1);

    let attempt = tokio::time::timeout(Duration::from_millis(100), pool.initialize()).await;
    assert!(attempt.is_err());
    // Let the spawned close of the first connection run.
    tokio::task::yield_now().await;

    assert!(!pool.is_initialized());
    assert_eq!(pool.status().live, 0);
    assert_eq!(state.opened.load(Ordering::SeqCst), 1);
    assert_eq!(state.open_connections(), 0);

    state.stop_hanging_connects();
    assert_ok!(pool.initialize().await);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert_eq!(pool.status().in_use, 2);
    a.release().await;
    b.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_initialize_cancelled_in_hook_reruns_hook() {
    let (pool, state) = mock_pool(pool_config(2, 3));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        pool.register_post_init_hook(move |pool| {
            let calls = Arc::clone(&calls);
            async move {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                let conn = pool.acquire().await?;
                if first {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                conn.release().await;
                Ok(())
            }
        })
        .unwrap();
    }

    let attempt = tokio::time::timeout(Duration::from_millis(100), pool.initialize()).await;
    assert!(attempt.is_err());
    assert!(!pool.is_initialized());

    assert_ok!(pool.initialize().await);
    assert!(pool.is_initialized());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().live, 2);
    assert_eq!(state.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_pool_not_ready_until_hooks_finish() {
    let (pool, _state) = mock_pool(pool_config(1, 2));
    let seen_ready = Arc::new(Mutex::new(None));
    {
        let seen_ready = Arc::clone(&seen_ready);
        pool.register_post_init_hook(move |pool| {
            let seen_ready = Arc::clone(&seen_ready);
            async move {
                *seen_ready.lock().unwrap() = Some(pool.is_initialized());
                Ok(())
            }
        })
        .unwrap();
    }

    assert_ok!(pool.initialize().await);
    assert_eq!(*seen_ready.lock().unwrap(), Some(false));
    assert!(pool.is_initialized());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (pool, state) = mock_pool(pool_config(2, 3));
    pool.initialize().await.unwrap();

    pool.shutdown().await;
    pool.shutdown().await;

    assert!(pool.is_closed());
    assert_eq!(state.closed.load(Ordering::SeqCst), 2);
    assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
    assert!(matches!(pool.initialize().await, Err(DbError::PoolClosed)));
}

#[tokio::test]
async fn test_connection_released_after_shutdown_is_closed() {
    let (pool, state) = mock_pool(pool_config(1, 1));
    let conn = pool.acquire().await.unwrap();
    pool.shutdown().await;
    conn.release().await;
    assert_eq!(state.open_connections(), 0);
    assert_eq!(pool.status().live, 0);
}

#[tokio::test]
async fn test_health_check_discards_failed_connections() {
    let config = pool_config(2, 2).health_check(HealthCheckMode::All);
    let (pool, state) = mock_pool(config);
    pool.initialize().await.unwrap();
    assert!(pool.health_check().await);

    state.ping_fails.store(true, Ordering::SeqCst);
    assert!(!pool.health_check().await);
    assert_eq!(pool.status().live, 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 2);

    state.ping_fails.store(false, Ordering::SeqCst);
    assert!(pool.health_check().await);
    assert_eq!(pool.status().live, 1);
}

#[tokio::test]
async fn test_health_check_one_connection() {
    let (pool, state) = mock_pool(pool_config(1, 2));
    assert!(pool.health_check().await);
    state.ping_fails.store(true, Ordering::SeqCst);
    assert!(!pool.health_check().await);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_on_busy_pool_does_not_wait() {
    let (pool, state) = mock_pool(pool_config(1, 1));
    let held = pool.acquire().await.unwrap();

    let started = tokio::time::Instant::now();
    assert!(pool.health_check().await);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(state.opened.load(Ordering::SeqCst), 1);

    held.release().await;
    assert!(pool.health_check().await);
}

#[tokio::test(start_paused = true)]
async fn test_statement_timeout_marks_connection_broken() {
    let config = pool_config(1, 1).statement_timeout(Duration::from_millis(50));
    let (pool, state) = mock_pool(config);
    state.hang_on("pg_sleep");

    let mut conn = pool.acquire().await.unwrap();
    match conn.execute("select pg_sleep(10)", &[]).await {
        Err(DbError::Timeout { operation, elapsed_ms }) => {
            assert_eq!(operation, "SELECT statement");
            assert_eq!(elapsed_ms, 50);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(conn.is_broken());
    conn.release().await;

    assert_eq!(pool.status().live, 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 1);

    let fresh = assert_ok!(pool.acquire().await);
    assert!(!fresh.is_broken());
}

#[tokio::test]
async fn test_statement_error_keeps_connection() {
    let (pool, state) = mock_pool(pool_config(1, 1));
    state.fail_on("bad_table");

    let mut conn = pool.acquire().await.unwrap();
    assert!(matches!(
        conn.execute("SELECT * FROM bad_table", &[]).await,
        Err(DbError::Database { .. })
    ));
    assert!(!conn.is_broken());
    let id = conn.id();
    conn.release().await;

    let again = pool.acquire().await.unwrap();
    assert_eq!(again.id(), id);
}

#[tokio::test]
async fn test_connection_released_in_transaction_is_discarded() {
    let (pool, state) = mock_pool(pool_config(1, 1));
    let mut conn = pool.acquire().await.unwrap();
    conn.begin().await.unwrap();
    assert!(conn.in_transaction());
    conn.release().await;

    assert_eq!(pool.status().live, 0);
    assert_eq!(state.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_native_json_mode_registers_adapter() {
    let (pool, _state) = support::native_pool();
    let conn = pool.acquire().await.unwrap();
    assert!(conn.json_adapter_registered());

    let (custom, _state) = mock_pool(pool_config(1, 1));
    let conn = custom.acquire().await.unwrap();
    assert!(!conn.json_adapter_registered());
}

#[tokio::test]
async fn test_connect_failure_frees_slot() {
    let (pool, state) = mock_pool(pool_config(0, 1));
    pool.initialize().await.unwrap();
    state.connect_failures.store(1, Ordering::SeqCst);

    assert!(matches!(pool.acquire().await, Err(DbError::Connection { .. })));
    assert_eq!(pool.status().live, 0);
    assert_ok!(pool.acquire().await);
}

#[test]
fn test_invalid_config_rejected() {
    let connector = support::MockConnector::new();
    let bad = PoolConfig::new().min_size(4).max_size(2);
    assert!(matches!(
        pg_toolkit::db::ConnectionPool::new(connector, bad),
        Err(DbError::Configuration { .. })
    ));
}
