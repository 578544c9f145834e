//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 秒杀下单管道集成测试

use crate::common::{memory_coordinator, wait_until};
use futures::future::join_all;
use oxflash::admission::{AdmissionOutcome, SeaOrmOrderRepository};
use oxflash::config::{Config, DatabaseConfig};
use oxflash::context::CallerContext;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[path = "../common/mod.rs"]
mod common;

const VOUCHER: u64 = 7;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.admission.block_timeout_ms = 100;
    config.admission.recovery_backoff_ms = 50;
    config
}

async fn repository(stock: u64) -> Arc<SeaOrmOrderRepository> {
    let repository = SeaOrmOrderRepository::connect(&DatabaseConfig::default())
        .await
        .unwrap();
    repository.init_schema().await.unwrap();
    repository
        .upsert_voucher_stock(VOUCHER, stock)
        .await
        .unwrap();
    Arc::new(repository)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_stock_hundred_users() {
    let (_, coordinator) = memory_coordinator(fast_config());
    let repository = repository(1).await;
    let admission = coordinator.admission();
    admission.load_stock(VOUCHER, 1).await.unwrap();
    coordinator.start_consumer(repository.clone()).await.unwrap();

    let mut users: Vec<u64> = (1..=100).collect();
    users.shuffle(&mut rand::thread_rng());

    let tasks = users.into_iter().map(|user| {
        let admission = admission.clone();
        tokio::spawn(async move { admission.submit(&CallerContext::new(user), VOUCHER).await })
    });
    let outcomes: Vec<AdmissionOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let admitted = outcomes
        .iter()
        .filter(|o| matches!(o, AdmissionOutcome::Admitted { .. }))
        .count();
    let sold_out = outcomes
        .iter()
        .filter(|o| **o == AdmissionOutcome::InsufficientStock)
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(sold_out, 99);
    assert_eq!(admission.stock(VOUCHER).await.unwrap(), Some(0));

    let repo = repository.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let repo = repo.clone();
            async move { repo.count_orders(VOUCHER).await.unwrap() == 1 }
        })
        .await
    );
    coordinator.shutdown().await.unwrap();

    assert_eq!(repository.count_orders(VOUCHER).await.unwrap(), 1);
    assert_eq!(repository.stock_of(VOUCHER).await.unwrap(), Some(0));
    assert_eq!(admission.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_user_five_times() {
    let (store, coordinator) = memory_coordinator(fast_config());
    let admission = coordinator.admission();
    admission.init().await.unwrap();
    admission.load_stock(VOUCHER, 10).await.unwrap();

    let ctx = CallerContext::new(1010);
    let tasks = (0..5).map(|_| {
        let admission = admission.clone();
        tokio::spawn(async move { admission.submit(&ctx, VOUCHER).await })
    });
    let outcomes: Vec<AdmissionOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let admitted = outcomes
        .iter()
        .filter(|o| matches!(o, AdmissionOutcome::Admitted { .. }))
        .count();
    let duplicates = outcomes
        .iter()
        .filter(|o| **o == AdmissionOutcome::DuplicateOrder)
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(duplicates, 4);
    assert_eq!(admission.stock(VOUCHER).await.unwrap(), Some(9));
    assert_eq!(store.stream_len("stream.orders").await, 1);
    assert_eq!(
        coordinator
            .metrics()
            .get("admission", "submit", "duplicate"),
        4
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_orders_persist_with_unique_ids() {
    let (_, coordinator) = memory_coordinator(fast_config());
    let repository = repository(20).await;
    let admission = coordinator.admission();
    admission.load_stock(VOUCHER, 20).await.unwrap();
    coordinator.start_consumer(repository.clone()).await.unwrap();

    let tasks = (1..=30u64).map(|user| {
        let admission = admission.clone();
        tokio::spawn(async move { admission.submit(&CallerContext::new(user), VOUCHER).await })
    });
    let order_ids: HashSet<u64> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|r| match r.unwrap().unwrap() {
            AdmissionOutcome::Admitted { order_id } => Some(order_id),
            _ => None,
        })
        .collect();
    assert_eq!(order_ids.len(), 20);

    let repo = repository.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let repo = repo.clone();
            async move { repo.count_orders(VOUCHER).await.unwrap() == 20 }
        })
        .await
    );
    coordinator.shutdown().await.unwrap();
    assert_eq!(repository.stock_of(VOUCHER).await.unwrap(), Some(0));
    assert_eq!(
        coordinator.metrics().get("consumer", "order", "persisted"),
        20
    );
}

#[tokio::test]
async fn test_second_consumer_start_is_rejected() {
    let (_, coordinator) = memory_coordinator(fast_config());
    let repository = repository(1).await;
    coordinator.start_consumer(repository.clone()).await.unwrap();
    assert!(coordinator.start_consumer(repository).await.is_err());
    coordinator.shutdown().await.unwrap();
}
