//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 按键互斥与租约锁集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{fast_lock, setup_logging};
use oxcoord::config::LockOptions;
use oxcoord::{CacheError, KeyScopedMutex, KvSubstrate, LeaseLock, MemorySubstrate};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_shares_one_result() {
    setup_logging();
    let mutex = KeyScopedMutex::<String>::new("shared");
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(32));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let mutex = mutex.clone();
        let calls = calls.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            mutex
                .run_exclusive_once("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok("computed".to_string())
                })
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "computed");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mutex.in_flight(), 0);
}

#[tokio::test]
async fn test_exclusive_error_reaches_all_waiters() {
    let mutex = KeyScopedMutex::<u32>::new("errors");

    let first = mutex.run_exclusive_once("k", || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(CacheError::LoadFailure {
            key: "k".to_string(),
            message: "boom".to_string(),
        })
    });
    let second = mutex.run_exclusive_once("k", || async { Ok(7) });
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Err(CacheError::LoadFailure { .. })));
    assert_eq!(first, second);

    // 失败不会被记住，下一次调用重新执行
    let third = mutex.run_exclusive_once("k", || async { Ok(7) }).await;
    assert_eq!(third, Ok(7));
}

#[tokio::test]
async fn test_different_keys_run_in_parallel() {
    let mutex = KeyScopedMutex::<usize>::new("parallel");
    let started = tokio::time::Instant::now();

    let a = mutex.run_exclusive_once("a", || async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(1)
    });
    let b = mutex.run_exclusive_once("b", || async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(2)
    });
    let (a, b) = tokio::join!(a, b);

    assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
    assert!(started.elapsed() < Duration::from_millis(380));
}

#[tokio::test]
async fn test_abandoned_waiter_does_not_cancel_action() {
    let mutex = KeyScopedMutex::<u32>::new("abandon");
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        mutex.run_exclusive_once("k", move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(9)
        }),
    )
    .await;
    assert!(abandoned.is_err());

    // 仍在运行的动作被新调用者加入
    let joined = mutex
        .run_exclusive_once("k", || async { Ok(0) })
        .await
        .unwrap();
    assert_eq!(joined, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_background_runs_at_most_one() {
    let mutex = KeyScopedMutex::<()>::new("background");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut scheduled = 0;
    for _ in 0..10 {
        let calls = calls.clone();
        if mutex.run_at_most_one_concurrent("k", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }) {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
    assert!(mutex.is_running_in_background("k"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!mutex.is_running_in_background("k"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 之前的动作结束后可以再次调度
    assert!(mutex.run_at_most_one_concurrent("k", || async {
        Err(CacheError::Substrate("logged only".to_string()))
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mutex.in_flight(), 0);
}

#[tokio::test]
async fn test_lease_lock_mutual_exclusion() {
    setup_logging();
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let lock = LeaseLock::new(substrate.clone(), fast_lock());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = lock.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        handles.push(tokio::spawn(async move {
            let guard = lock.acquire("oxcoord:test:lock:k").await.unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            max_inside.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            assert!(guard.release().await.unwrap());
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(!substrate.exists("oxcoord:test:lock:k").await.unwrap());
}

#[tokio::test]
async fn test_lease_expires_after_crash() {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let options = LockOptions {
        lease_ms: 100,
        wait_timeout_ms: 1_000,
        retry_interval_ms: 10,
    };
    let lock = LeaseLock::new(substrate, options);

    // 模拟持有者崩溃：守卫被遗忘，不会释放
    let crashed = lock.acquire("crash").await.unwrap();
    std::mem::forget(crashed);

    assert!(lock.try_acquire("crash").await.unwrap().is_none());
    let started = tokio::time::Instant::now();
    let guard = lock.acquire("crash").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(guard.release().await.unwrap());
}

#[tokio::test]
async fn test_dropped_guard_releases_in_background() {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let lock = LeaseLock::new(substrate.clone(), fast_lock());

    drop(lock.acquire("dropped").await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!substrate.exists("dropped").await.unwrap());
}
