//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 全局ID生成器集成测试

use crate::common::setup_logging;
use futures::future::join_all;
use oxflash::backend::MemoryBackend;
use oxflash::id::IdGenerator;
use oxflash::metrics::Metrics;
use std::collections::HashSet;
use std::sync::Arc;

#[path = "../common/mod.rs"]
mod common;

const EPOCH: i64 = 1_640_995_200;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_ten_thousand_concurrent_ids_are_unique() {
    setup_logging();
    let store = Arc::new(MemoryBackend::new());
    let metrics = Arc::new(Metrics::new());
    // 两个实例共享同一个计数器
    let generators = [
        Arc::new(IdGenerator::new(store.clone(), "icr:", EPOCH, metrics.clone())),
        Arc::new(IdGenerator::new(store.clone(), "icr:", EPOCH, metrics.clone())),
    ];

    let tasks = (0..100).map(|task| {
        let ids = generators[task % 2].clone();
        tokio::spawn(async move {
            let mut allocated = Vec::with_capacity(100);
            for _ in 0..100 {
                allocated.push(ids.next_id("order").await.unwrap());
            }
            allocated
        })
    });

    let mut all = HashSet::new();
    for result in join_all(tasks).await {
        let allocated = result.unwrap();
        for pair in allocated.windows(2) {
            assert!(pair[0] >> 32 <= pair[1] >> 32, "timestamp went backwards");
        }
        all.extend(allocated);
    }
    assert_eq!(all.len(), 10_000);
    assert_eq!(metrics.get("id", "next", "ok"), 10_000);
}

#[tokio::test]
async fn test_id_timestamp_matches_wall_clock() {
    let store = Arc::new(MemoryBackend::new());
    let ids = IdGenerator::new(store, "icr:", EPOCH, Arc::new(Metrics::new()));

    let before = chrono::Utc::now().timestamp();
    let id = ids.next_id("shop").await.unwrap();
    let after = chrono::Utc::now().timestamp();

    let ts = ids.timestamp_of(id);
    assert!(before <= ts && ts <= after);
    assert!(IdGenerator::sequence_of(id) >= 1);
}
