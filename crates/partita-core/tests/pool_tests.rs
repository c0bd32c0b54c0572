use partita_core::{ConnectionPool, Endpoint, MemoryFactory, MemoryStore, PdalError, PoolStats, Role};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn warm_pool(capacity: usize) -> (MemoryStore, ConnectionPool) {
    let store = MemoryStore::new();
    let factory = MemoryFactory::new();
    factory.register("db:5432", store.clone());
    let endpoint = Endpoint::new(Role::Primary, "db", 5432).with_namespace("partition_0");
    let pool = ConnectionPool::warm(endpoint, Arc::new(factory), capacity).unwrap();
    (store, pool)
}

fn assert_balanced(stats: PoolStats) {
    assert_eq!(stats.available() + stats.checked_out, stats.capacity, "{:?}", stats);
}

#[test]
fn test_waiter_is_woken_by_release() {
    let (_store, pool) = warm_pool(1);
    let held = pool.acquire(Duration::from_millis(10)).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let started = Instant::now();
            let conn = pool.acquire(Duration::from_secs(5)).expect("waiter should get a connection");
            drop(conn);
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.stats().checked_out, 1);
        pool.release(held);

        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40), "waiter returned after {:?}", waited);
    });

    assert_eq!(pool.stats().idle, 1);
}

#[test]
fn test_many_threads_share_small_pool() {
    let (store, pool) = warm_pool(3);
    let max_seen = AtomicUsize::new(0);
    let in_use = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..24 {
            s.spawn(|| {
                for _ in 0..5 {
                    let conn = pool.acquire(Duration::from_secs(10)).unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    assert_balanced(pool.stats());
                    thread::sleep(Duration::from_millis(1));
                    in_use.fetch_sub(1, Ordering::SeqCst);
                    drop(conn);
                }
            });
        }
    });

    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert_eq!(
        pool.stats(),
        PoolStats {
            capacity: 3,
            idle: 3,
            vacant: 0,
            checked_out: 0
        }
    );
    // No connection was opened beyond the warm-up.
    assert_eq!(store.connect_count(), 3);
}

#[test]
fn test_timed_out_waiters_do_not_disturb_pool() {
    let (_store, pool) = warm_pool(2);
    let a = pool.acquire(Duration::from_millis(10)).unwrap();
    let b = pool.acquire(Duration::from_millis(10)).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let err = pool.acquire(Duration::from_millis(20)).unwrap_err();
                assert!(matches!(err, PdalError::PoolExhausted { .. }));
                assert!(err.is_retryable());
            });
        }
    });

    assert_eq!(pool.stats().checked_out, 2);
    drop(a);
    drop(b);
    assert_eq!(pool.stats().idle, 2);
    assert_balanced(pool.stats());
}

#[test]
fn test_close_wakes_waiters() {
    let (_store, pool) = warm_pool(1);
    let held = pool.acquire(Duration::from_millis(10)).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| pool.acquire(Duration::from_secs(10)).map(drop));
        thread::sleep(Duration::from_millis(30));
        pool.close();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PdalError::PoolClosed { .. })));
    });

    drop(held);
    assert_balanced(pool.stats());
}

#[test]
fn test_broken_connections_are_never_handed_out() {
    let (store, pool) = warm_pool(2);
    {
        let mut a = pool.acquire(Duration::from_millis(10)).unwrap();
        let mut b = pool.acquire(Duration::from_millis(10)).unwrap();
        a.mark_broken();
        b.mark_broken();
    }
    assert_eq!(pool.stats().vacant, 2);

    for _ in 0..4 {
        let conn = pool.acquire(Duration::from_millis(10)).unwrap();
        assert!(conn.is_healthy());
        assert!(!conn.is_broken());
    }
    // Sequential acquires reuse the first replacement; the second slot stays vacant.
    assert_eq!(store.connect_count(), 3);
    assert_eq!(pool.stats().vacant, 1);
}
