//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 旁路缓存客户端集成测试

use crate::common::{memory_coordinator, wait_until, ShopLoader};
use futures::future::join_all;
use oxflash::backend::StoreBackend;
use oxflash::config::Config;
use oxflash::lock::DistributedLock;
use oxflash::metrics::Metrics;
use oxflash::FlashError;
use std::sync::Arc;
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

const PREFIX: &str = "cache:shop:";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logical_expire_single_rebuild_under_load() {
    let (store, coordinator) = memory_coordinator(Config::default());
    let cache = coordinator.cache();
    let loader = Arc::new(ShopLoader::with_delay(Duration::from_millis(200)));
    loader.put(1, "103茶餐厅", 37).await;

    let stale = common::Shop {
        id: 1,
        name: "旧名字".to_string(),
        score: 10,
    };
    cache
        .set_with_logical_expire(PREFIX, 1, &stale, Duration::ZERO)
        .await
        .unwrap();

    let tasks = (0..64).map(|_| {
        let cache = cache.clone();
        let loader = loader.clone();
        tokio::spawn(async move {
            cache
                .get_with_logical_expire(PREFIX, &1, loader, Duration::from_secs(60))
                .await
        })
    });
    let results = join_all(tasks).await;
    let stale_reads = results
        .into_iter()
        .map(|result| result.unwrap().unwrap().unwrap())
        .filter(|shop| shop == &stale)
        .count();
    assert!(stale_reads > 0);

    let metrics = coordinator.metrics();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let store = store.clone();
            let metrics = metrics.clone();
            async move {
                store.get("lock:cache:shop:1").await.unwrap().is_none()
                    && metrics.get("cache", "rebuild", "done") == 1
            }
        })
        .await
    );
    assert_eq!(loader.call_count(), 1);

    let fresh = cache
        .get_with_logical_expire(PREFIX, &1, loader.clone(), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.name, "103茶餐厅");
    assert_eq!(loader.call_count(), 1);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logical_rebuild_of_removed_entity_stores_null_data() {
    let (_, coordinator) = memory_coordinator(Config::default());
    let cache = coordinator.cache();
    let loader = Arc::new(ShopLoader::new());
    loader.put(2, "老街面馆", 20).await;
    cache
        .warm(PREFIX, &2, loader.as_ref(), Duration::ZERO)
        .await
        .unwrap();
    loader.remove(2).await;

    let stale = cache
        .get_with_logical_expire(PREFIX, &2, loader.clone(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(stale.map(|s| s.name), Some("老街面馆".to_string()));

    coordinator.shutdown().await.unwrap();
    let after = cache
        .get_with_logical_expire(PREFIX, &2, loader.clone(), Duration::from_secs(60))
        .await
        .unwrap();
    assert!(after.is_none());
}

#[tokio::test]
async fn test_failed_rebuild_releases_lock_and_keeps_stale_value() {
    let (store, coordinator) = memory_coordinator(Config::default());
    let cache = coordinator.cache();
    let loader = Arc::new(ShopLoader::failing());
    let stale = common::Shop {
        id: 3,
        name: "stale".to_string(),
        score: 1,
    };
    cache
        .set_with_logical_expire(PREFIX, 3, &stale, Duration::ZERO)
        .await
        .unwrap();

    let value = cache
        .get_with_logical_expire(PREFIX, &3, loader.clone(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(value, Some(stale.clone()));

    coordinator.shutdown().await.unwrap();
    assert_eq!(coordinator.metrics().get("cache", "rebuild", "failed"), 1);
    assert!(store.get("lock:cache:shop:3").await.unwrap().is_none());

    let again = cache
        .get_with_logical_expire(PREFIX, &3, loader.clone(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(again, Some(stale));
}

#[tokio::test]
async fn test_null_marker_suppresses_fetch_until_expiry() {
    let mut config = Config::default();
    config.cache.null_ttl = 1;
    let (store, coordinator) = memory_coordinator(config);
    let cache = coordinator.cache();
    let loader = ShopLoader::new();

    for _ in 0..20 {
        let value = cache
            .get_with_pass_through(PREFIX, &404, &loader, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(value.is_none());
    }
    assert_eq!(loader.call_count(), 1);
    assert_eq!(store.get("cache:shop:404").await.unwrap(), Some(Vec::new()));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    cache
        .get_with_pass_through(PREFIX, &404, &loader, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(loader.call_count(), 2);
}

#[tokio::test]
async fn test_whitespace_value_reads_as_null_marker() {
    let (store, coordinator) = memory_coordinator(Config::default());
    let loader = ShopLoader::new();
    loader.put(5, "should not load", 1).await;
    store.set("cache:shop:5", b"  ", Some(60)).await.unwrap();

    let value = coordinator
        .cache()
        .get_with_pass_through(PREFIX, &5, &loader, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(value.is_none());
    assert_eq!(loader.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutex_strategy_fetches_once_under_load() {
    let (_, coordinator) = memory_coordinator(Config::default());
    let cache = coordinator.cache();
    let loader = Arc::new(ShopLoader::with_delay(Duration::from_millis(150)));
    loader.put(1, "103茶餐厅", 37).await;

    let tasks = (0..32).map(|_| {
        let cache = cache.clone();
        let loader = loader.clone();
        tokio::spawn(async move {
            cache
                .get_with_mutex(PREFIX, &1, loader.as_ref(), Duration::from_secs(60))
                .await
        })
    });
    for result in join_all(tasks).await {
        let shop = result.unwrap().unwrap().unwrap();
        assert_eq!(shop.id, 1);
    }
    assert_eq!(loader.call_count(), 1);
}

#[tokio::test]
async fn test_mutex_strategy_times_out_while_another_instance_rebuilds() {
    let mut config = Config::default();
    config.cache.mutex_retry_interval_ms = 20;
    config.cache.mutex_max_wait_ms = 200;
    let (store, coordinator) = memory_coordinator(config);
    let loader = ShopLoader::new();
    loader.put(7, "should not load", 1).await;

    let other = DistributedLock::new(store.clone(), "lock:", Arc::new(Metrics::new()));
    let held = other.try_acquire("cache:shop:7", 30).await.unwrap().unwrap();

    let started = tokio::time::Instant::now();
    let result = coordinator
        .cache()
        .get_with_mutex(PREFIX, &7, &loader, Duration::from_secs(60))
        .await;
    assert!(matches!(result, Err(FlashError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(loader.call_count(), 0);
    assert_eq!(coordinator.metrics().get("cache", "mutex", "timeout"), 1);

    assert!(other.release(&held).await.unwrap());
}

#[tokio::test]
async fn test_set_then_invalidate() {
    let (store, coordinator) = memory_coordinator(Config::default());
    let cache = coordinator.cache();
    let loader = ShopLoader::new();
    loader.put(9, "fresh", 5).await;

    let cached = common::Shop {
        id: 9,
        name: "cached".to_string(),
        score: 5,
    };
    cache
        .set(PREFIX, 9, &cached, Duration::from_secs(60))
        .await
        .unwrap();
    let hit = cache
        .get_with_pass_through(PREFIX, &9, &loader, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(hit, Some(cached));
    assert_eq!(loader.call_count(), 0);

    cache.invalidate(PREFIX, 9).await.unwrap();
    assert!(store.get("cache:shop:9").await.unwrap().is_none());
    let reloaded = cache
        .get_with_pass_through(PREFIX, &9, &loader, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(reloaded.map(|s| s.name), Some("fresh".to_string()));
}
