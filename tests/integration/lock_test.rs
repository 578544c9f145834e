//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 分布式锁集成测试

use crate::common::setup_logging;
use futures::future::join_all;
use oxflash::backend::{AdmissionKeys, MemoryBackend, StoreBackend, ADMIT_OK};
use oxflash::lock::DistributedLock;
use oxflash::metrics::Metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

/// 共享同一存储的两个"进程"
fn two_instances() -> (Arc<MemoryBackend>, Arc<DistributedLock>, Arc<DistributedLock>) {
    setup_logging();
    let store = Arc::new(MemoryBackend::new());
    let metrics = Arc::new(Metrics::new());
    let a = Arc::new(DistributedLock::new(store.clone(), "lock:", metrics.clone()));
    let b = Arc::new(DistributedLock::new(store.clone(), "lock:", metrics));
    (store, a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_concurrent_acquirer_wins() {
    let (_, a, b) = two_instances();

    let tasks = (0..100).map(|i| {
        let lock = if i % 2 == 0 { a.clone() } else { b.clone() };
        tokio::spawn(async move { lock.try_acquire("order:1010", 10).await })
    });
    let winners = join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(Some(_)))))
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_expired_owner_cannot_release_new_owner() {
    let (store, a, b) = two_instances();

    let first = a.try_acquire("shop:1", 1).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let second = b.try_acquire("shop:1", 10).await.unwrap().unwrap();
    assert!(!a.release(&first).await.unwrap());
    assert_eq!(
        store.get("lock:shop:1").await.unwrap(),
        Some(second.owner_token.clone().into_bytes())
    );

    assert!(b.release(&second).await.unwrap());
    assert!(store.get("lock:shop:1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_same_instance_tasks_are_excluded() {
    let (_, a, _) = two_instances();
    let held = a.try_acquire("voucher:7", 10).await.unwrap().unwrap();
    assert!(a.try_acquire("voucher:7", 10).await.unwrap().is_none());
    assert!(a.release(&held).await.unwrap());
    assert!(!a.release(&held).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_acquire_serializes_critical_section() {
    let (_, a, b) = two_instances();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks = (0..10).map(|i| {
        let lock = if i % 2 == 0 { a.clone() } else { b.clone() };
        let inside = inside.clone();
        let overlaps = overlaps.clone();
        let completed = completed.clone();
        tokio::spawn(async move {
            let handle = lock
                .acquire_with_retry(
                    "critical",
                    10,
                    Duration::from_millis(5),
                    Duration::from_secs(10),
                )
                .await
                .unwrap()
                .expect("lock acquired within max wait");
            if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            lock.release(&handle).await.unwrap();
            completed.fetch_add(1, Ordering::SeqCst);
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(completed.load(Ordering::SeqCst), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_and_stock_survive_cache_flood() {
    let (store, a, b) = two_instances();
    let keys = AdmissionKeys {
        stock_key: "seckill:stock:7".to_string(),
        order_key: "seckill:order:7".to_string(),
        stream_key: "stream.orders".to_string(),
    };
    store.set(&keys.stock_key, b"1000", None).await.unwrap();
    let held = a.try_acquire("order:1", 600).await.unwrap().unwrap();

    for i in 0..150_000u64 {
        store
            .set(&format!("cache:shop:{}", i), b"{\"id\":1}", Some(1800))
            .await
            .unwrap();
    }

    assert_eq!(
        store.get(&keys.stock_key).await.unwrap(),
        Some(b"1000".to_vec())
    );
    assert!(b.try_acquire("order:1", 600).await.unwrap().is_none());
    assert_eq!(store.admit(&keys, 7, 1, 100).await.unwrap(), ADMIT_OK);
    assert!(a.release(&held).await.unwrap());
}
