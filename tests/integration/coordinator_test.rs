//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 协调器集成测试

#[path = "../common/mod.rs"]
mod common;

use common::setup_logging;
use oxcoord::metrics::{get_metrics_string, GLOBAL_METRICS};
use oxcoord::{CacheError, Config, Coordinator, KvSubstrate, MemorySubstrate};
use std::collections::BTreeMap;
use std::sync::Arc;

const CONFIG: &str = r#"
    config_version = 1

    [global]
    namespace = "shop"
    default_ttl_ms = 60000

    [global.lock]
    lease_ms = 2000
    wait_timeout_ms = 2000
    retry_interval_ms = 5

    [caches.products]
    kind = "loading"
    max_entries = 100

    [caches.orders]
    kind = "distributed"

    [caches.profiles]
    kind = "tiered"
    ttl_ms = 30000

    [caches.quotes]
    kind = "refresh_ahead"

    [caches.quotes.refresh]
    logical_ttl_ms = 15000
    physical_ttl_ms = 20000

    [caches.coupons]
    kind = "consumable_list"

    [caches.coupons.partition]
    max_reloads = 2

    [caches.seats]
    kind = "consumable_map"

    [caches.recent_views]
    kind = "bounded"
    capacity = 3

    [caches.stock]
    kind = "counter"
"#;

fn coordinator(substrate: Arc<dyn KvSubstrate>) -> Coordinator {
    Coordinator::with_substrate(Config::from_toml_str(CONFIG).unwrap(), substrate).unwrap()
}

#[tokio::test]
async fn test_connect_with_memory_substrate() {
    setup_logging();
    let coordinator = Coordinator::connect(Config::from_toml_str(CONFIG).unwrap())
        .await
        .unwrap();

    coordinator.ping().await.unwrap();
    assert_eq!(coordinator.substrate().name(), "memory");
    assert_eq!(coordinator.context().namespace, "shop");
    assert_eq!(
        coordinator.cache_names(),
        vec![
            "coupons",
            "orders",
            "products",
            "profiles",
            "quotes",
            "recent_views",
            "seats",
            "stock"
        ]
    );
}

#[tokio::test]
async fn test_every_component_is_constructible() {
    let coordinator = coordinator(Arc::new(MemorySubstrate::new()));

    let products = coordinator
        .loading_cache("products", |key: String| async move {
            Ok::<_, anyhow::Error>(Some(format!("product {}", key)))
        })
        .unwrap();
    assert_eq!(
        products.get("p1").await.unwrap(),
        Some("product p1".to_string())
    );

    let orders = coordinator
        .distributed_cache("orders", |_key: String| async { Ok::<_, anyhow::Error>(Some(1u64)) })
        .unwrap();
    assert_eq!(orders.get("o1").await.unwrap(), Some(1));

    let profiles = coordinator
        .tiered_cache("profiles", |_key: String| async { Ok::<_, anyhow::Error>(Some(true)) })
        .await
        .unwrap();
    assert_eq!(profiles.get("u1").await.unwrap(), Some(true));

    let quotes = coordinator
        .refresh_ahead_cache("quotes", |_key: String| async {
            Ok::<_, anyhow::Error>(Some(3.5f64))
        })
        .unwrap();
    assert_eq!(quotes.get("q1").await.unwrap(), Some(3.5));

    let coupons = coordinator
        .consumable_list("coupons", |_key: String| async {
            Ok::<_, anyhow::Error>(vec![1u32, 2, 3])
        })
        .unwrap();
    assert_eq!(coupons.take("spring", 2).await.unwrap(), vec![1, 2]);

    let seats = coordinator
        .consumable_map("seats", |_key: String| async {
            Ok::<_, anyhow::Error>(BTreeMap::from([("a1".to_string(), 10u32)]))
        })
        .unwrap();
    assert_eq!(seats.checkout("show", ["a1"]).await.unwrap().len(), 1);

    let views = coordinator.bounded_collection::<String>("recent_views").unwrap();
    assert_eq!(views.capacity(), 3);

    let stock = coordinator
        .counter("stock", |_key: String| async { Ok::<_, anyhow::Error>(10) })
        .unwrap();
    assert_eq!(stock.add_and_get("sku", -3).await.unwrap(), 7);
}

#[tokio::test]
async fn test_namespace_prefixes_substrate_keys() {
    let substrate = Arc::new(MemorySubstrate::new());
    let coordinator = coordinator(substrate.clone());
    let orders = coordinator
        .distributed_cache("orders", |_key: String| async { Ok::<_, anyhow::Error>(Some(1u8)) })
        .unwrap();

    orders.get("o1").await.unwrap();
    assert!(substrate.exists("shop:orders:entry:o1").await.unwrap());
}

#[tokio::test]
async fn test_unknown_or_mismatched_cache_rejected() {
    let coordinator = coordinator(Arc::new(MemorySubstrate::new()));

    let missing = coordinator.loading_cache("nope", |_key: String| async {
        Ok::<_, anyhow::Error>(Some(1u8))
    });
    assert!(matches!(missing, Err(CacheError::Configuration(_))));

    let wrong_kind = coordinator.counter("orders", |_key: String| async {
        Ok::<_, anyhow::Error>(0)
    });
    assert!(matches!(wrong_kind, Err(CacheError::Configuration(_))));
}

#[tokio::test]
async fn test_coordinators_share_substrate() {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    let first = coordinator(substrate.clone());
    let second = coordinator(substrate);

    let a = first
        .counter("stock", |_key: String| async { Ok::<_, anyhow::Error>(5) })
        .unwrap();
    let b = second
        .counter("stock", |_key: String| async { Ok::<_, anyhow::Error>(500) })
        .unwrap();

    assert_eq!(a.add_and_get("sku", 1).await.unwrap(), 6);
    assert_eq!(b.add_and_get("sku", 1).await.unwrap(), 7);
}

#[tokio::test]
async fn test_operations_are_recorded_in_metrics() {
    let coordinator = coordinator(Arc::new(MemorySubstrate::new()));
    let products = coordinator
        .loading_cache("products", |_key: String| async {
            Ok::<_, anyhow::Error>(Some(1u8))
        })
        .unwrap();

    let before = GLOBAL_METRICS.request_count("products", "loading", "get", "hit");
    products.get("p").await.unwrap();
    products.get("p").await.unwrap();
    assert!(GLOBAL_METRICS.request_count("products", "loading", "get", "hit") > before);
    assert!(get_metrics_string().contains("oxcoord_requests_total"));
}
