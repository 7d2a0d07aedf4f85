//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 可消费列表集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{memory_context, setup_logging, twin_contexts};
use oxcoord::substrate::memory::SWEEP_INTERVAL;
use oxcoord::{
    CacheContext, CacheError, CacheOptions, ConsumableListCache, KvSubstrate, MemorySubstrate,
    PartitionOptions,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

/// 每次加载返回 `size` 个带批次号的券码
fn coupon_list(
    context: &CacheContext,
    calls: Arc<AtomicUsize>,
    size: usize,
    max_reloads: u32,
) -> ConsumableListCache<String> {
    ConsumableListCache::new(
        context,
        "coupons",
        CacheOptions::default().with_ttl(Duration::from_secs(60)),
        PartitionOptions {
            max_reloads,
            ..Default::default()
        },
        move |key: String| {
            let calls = calls.clone();
            async move {
                let batch = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(
                    (0..size)
                        .map(|i| format!("{}-b{}-{}", key, batch, i))
                        .collect::<Vec<_>>(),
                )
            }
        },
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_element_delivered_exactly_once() {
    setup_logging();
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let lists = [
        coupon_list(&first, calls.clone(), 100, 0),
        coupon_list(&second, calls.clone(), 100, 0),
    ];
    let barrier = Arc::new(Barrier::new(16));

    let mut handles = Vec::new();
    for i in 0..16 {
        let list = lists[i % 2].clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut taken = Vec::new();
            loop {
                let count = rand::thread_rng().gen_range(1..=5);
                let batch = list.take("spring", count).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                taken.extend(batch);
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_take_returns_contiguous_slices() {
    let calls = Arc::new(AtomicUsize::new(0));
    let list = coupon_list(&memory_context(), calls, 5, 0);

    assert_eq!(
        list.take("k", 2).await.unwrap(),
        vec!["k-b0-0".to_string(), "k-b0-1".to_string()]
    );
    assert_eq!(list.remaining("k").await.unwrap(), 3);
    // 最后一段不足 count 个时返回剩余部分
    assert_eq!(list.take("k", 4).await.unwrap().len(), 3);
    assert!(list.take("k", 1).await.unwrap().is_empty());
    assert_eq!(list.remaining("k").await.unwrap(), 0);
}

#[tokio::test]
async fn test_take_or_reload_refills_exhausted_batch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let list = coupon_list(&memory_context(), calls.clone(), 2, 1);

    assert_eq!(list.take_or_reload("k", 2).await.unwrap().len(), 2);
    let refilled = list.take_or_reload("k", 1).await.unwrap();
    assert_eq!(refilled, vec!["k-b1-0".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reload_loads_once() {
    let (first, second) = twin_contexts();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = coupon_list(&first, calls.clone(), 4, 1);
    let b = coupon_list(&second, calls.clone(), 4, 1);

    assert_eq!(a.take("k", 4).await.unwrap().len(), 4);

    let (x, y) = tokio::join!(a.take_or_reload("k", 2), b.take_or_reload("k", 2));
    let mut taken = x.unwrap();
    taken.extend(y.unwrap());
    taken.sort();
    assert_eq!(
        taken,
        vec!["k-b1-0", "k-b1-1", "k-b1-2", "k-b1-3"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_batch_is_remembered() {
    let calls = Arc::new(AtomicUsize::new(0));
    let list = coupon_list(&memory_context(), calls.clone(), 0, 1);

    assert!(list.take("k", 1).await.unwrap().is_empty());
    assert!(list.take("k", 1).await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 重载出的批次仍为空时返回空列表而不是超时
    assert!(list.take_or_reload("k", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_plain_take_never_reloads() {
    let calls = Arc::new(AtomicUsize::new(0));
    let list = coupon_list(&memory_context(), calls.clone(), 1, 3);

    assert_eq!(list.take("k", 1).await.unwrap().len(), 1);
    assert!(list.take("k", 1).await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 每次耗尽都换一代批次
    for batch in 1..=3 {
        assert_eq!(
            list.take_or_reload("k", 1).await.unwrap(),
            vec![format!("k-b{}-0", batch)]
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_reload_and_invalidate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let list = coupon_list(&memory_context(), calls.clone(), 3, 0);

    list.take("k", 3).await.unwrap();
    assert_eq!(list.reload("k").await.unwrap(), 3);
    assert_eq!(list.remaining("k").await.unwrap(), 3);

    list.invalidate("k").await.unwrap();
    assert_eq!(list.remaining("k").await.unwrap(), 0);
    assert_eq!(list.take("k", 1).await.unwrap(), vec!["k-b2-0".to_string()]);
}

#[tokio::test]
async fn test_invalid_arguments() {
    let list = coupon_list(&memory_context(), Arc::new(AtomicUsize::new(0)), 3, 0);
    assert!(matches!(
        list.take("k", 0).await,
        Err(CacheError::InvalidArgument(_))
    ));
    assert!(matches!(
        list.take("", 1).await,
        Err(CacheError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_expired_batches_do_not_accumulate() {
    let substrate = Arc::new(MemorySubstrate::new());
    let context = CacheContext::new(substrate.clone()).with_lock_options(common::fast_lock());
    let list = ConsumableListCache::new(
        &context,
        "flash_sale",
        CacheOptions::default().with_ttl(Duration::from_millis(20)),
        PartitionOptions::default(),
        |key: String| async move { Ok::<_, anyhow::Error>(vec![format!("{}-0", key)]) },
    )
    .unwrap();

    let takes = (0..200).map(|i| {
        let list = list.clone();
        async move { list.take(&format!("sale-{}", i), 1).await }
    });
    for taken in futures::future::try_join_all(takes).await.unwrap() {
        assert_eq!(taken.len(), 1);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..SWEEP_INTERVAL {
        substrate
            .set(&format!("unrelated:{}", i), vec![], None)
            .await
            .unwrap();
    }
    // 过期的分区头、元素列表和消费进度都已被清扫
    assert_eq!(substrate.len(), SWEEP_INTERVAL);
}
