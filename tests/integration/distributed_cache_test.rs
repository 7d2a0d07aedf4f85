//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 共享加载缓存集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{setup_logging, twin_contexts, FlakySubstrate};
use oxcoord::config::LockOptions;
use oxcoord::{
    CacheContext, CacheError, CacheOptions, DistributedLoadingCache, KvSubstrate,
    MemorySubstrate,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: String,
    total_cents: u64,
}

fn order_cache(
    context: &CacheContext,
    calls: Arc<AtomicUsize>,
) -> DistributedLoadingCache<Order> {
    DistributedLoadingCache::new(
        context,
        "orders",
        CacheOptions::default().with_ttl(Duration::from_secs(60)),
        move |key: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, anyhow::Error>(Some(Order {
                    id: key,
                    total_cents: 1999,
                }))
            }
        },
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_load_across_processes() {
    setup_logging();
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let caches = [
        order_cache(&first, calls.clone()),
        order_cache(&second, calls.clone()),
    ];
    let barrier = Arc::new(Barrier::new(40));

    let mut handles = Vec::new();
    for i in 0..40 {
        let cache = caches[i % 2].clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            cache.get("o-1").await
        }));
    }
    for handle in handles {
        let order = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(order.id, "o-1");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shared_entries_visible_to_other_process() {
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let writer = order_cache(&first, calls.clone());
    let reader = order_cache(&second, calls.clone());

    let order = Order {
        id: "manual".to_string(),
        total_cents: 5,
    };
    writer.put("o-2", Some(order.clone())).await.unwrap();
    assert_eq!(reader.get("o-2").await.unwrap(), Some(order));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    reader.invalidate("o-2").await.unwrap();
    assert_eq!(writer.get_if_present("o-2").await.unwrap(), None);
}

#[tokio::test]
async fn test_invalidate_all_only_touches_own_entries() {
    let (context, _) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let orders = order_cache(&context, calls.clone());
    let others = DistributedLoadingCache::<u32>::new(
        &context,
        "others",
        CacheOptions::default(),
        |_key: String| async { Ok::<_, anyhow::Error>(Some(1)) },
    )
    .unwrap();

    orders.get("a").await.unwrap();
    orders.get("b").await.unwrap();
    others.get("a").await.unwrap();

    orders.invalidate_all().await.unwrap();
    assert_eq!(orders.get_if_present("a").await.unwrap(), None);
    assert_eq!(orders.get_if_present("b").await.unwrap(), None);
    assert_eq!(others.get_if_present("a").await.unwrap(), Some(Some(1)));
}

#[tokio::test]
async fn test_lock_timeout_reports_coordination_timeout() {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let context = CacheContext::new(substrate.clone()).with_lock_options(LockOptions {
        lease_ms: 5_000,
        wait_timeout_ms: 100,
        retry_interval_ms: 10,
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = order_cache(&context, calls.clone());

    // 另一个进程持有加载锁
    assert!(substrate
        .set_if_absent("oxcoord:orders:lock:o-3", b"other".to_vec(), None)
        .await
        .unwrap());

    let result = cache.get("o-3").await;
    assert!(matches!(result, Err(CacheError::CoordinationTimeout(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_substrate_failure_propagates() {
    let substrate = Arc::new(FlakySubstrate::new());
    let context = CacheContext::new(substrate.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = order_cache(&context, calls.clone());

    substrate.set_failing(true);
    assert!(matches!(
        cache.get("o-4").await,
        Err(CacheError::Substrate(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    substrate.set_failing(false);
    assert!(cache.get("o-4").await.unwrap().is_some());
}

#[tokio::test]
async fn test_corrupt_entry_is_serialization_error() {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let context = CacheContext::new(substrate.clone());
    let cache = order_cache(&context, Arc::new(AtomicUsize::new(0)));

    substrate
        .set("oxcoord:orders:entry:bad", b"not json".to_vec(), None)
        .await
        .unwrap();
    assert!(matches!(
        cache.get("bad").await,
        Err(CacheError::Serialization(_))
    ));
}

#[tokio::test]
async fn test_entry_reloaded_after_ttl() {
    let (context, _) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let loader_calls = calls.clone();
    let cache = DistributedLoadingCache::<u64>::new(
        &context,
        "quotes",
        CacheOptions::default().with_ttl(Duration::from_millis(80)),
        move |_key: String| {
            let calls = loader_calls.clone();
            async move { Ok::<_, anyhow::Error>(Some(calls.fetch_add(1, Ordering::SeqCst) as u64)) }
        },
    )
    .unwrap();

    assert_eq!(cache.get("q-1").await.unwrap(), Some(0));
    assert_eq!(cache.get("q-1").await.unwrap(), Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get_if_present("q-1").await.unwrap(), None);
    assert_eq!(cache.get("q-1").await.unwrap(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_triggers_reload() {
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let writer = order_cache(&first, calls.clone());
    let reader = order_cache(&second, calls.clone());

    assert!(writer.get("o-5").await.unwrap().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    reader.invalidate("o-5").await.unwrap();
    assert!(writer.get("o-5").await.unwrap().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(reader.get("o-5").await.unwrap().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_null_result_is_cached() {
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let missing_orders = |context: &CacheContext, calls: Arc<AtomicUsize>| {
        DistributedLoadingCache::<Order>::new(
            context,
            "missing",
            CacheOptions::default().with_ttl(Duration::from_secs(60)),
            move |_key: String| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(None)
                }
            },
        )
        .unwrap()
    };
    let loader_side = missing_orders(&first, calls.clone());
    let other_side = missing_orders(&second, calls.clone());

    assert_eq!(loader_side.get("ghost").await.unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 存储的空值是一次命中，而不是未命中
    assert_eq!(other_side.get_if_present("ghost").await.unwrap(), Some(None));
    assert_eq!(other_side.get("ghost").await.unwrap(), None);
    assert_eq!(loader_side.get("ghost").await.unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
