//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

use async_trait::async_trait;
use oxflash::backend::MemoryBackend;
use oxflash::cache::EntityLoader;
use oxflash::config::Config;
use oxflash::coordinator::Coordinator;
use oxflash::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .try_init()
            .ok();
    });
}

/// Redis地址，优先读取 `REDIS_URL`
#[allow(dead_code)]
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// 检查Redis是否可用
#[allow(dead_code)]
pub async fn is_redis_available() -> bool {
    let Ok(client) = redis::Client::open(redis_url()) else {
        return false;
    };
    match tokio::time::timeout(
        Duration::from_millis(500),
        client.get_multiplexed_async_connection(),
    )
    .await
    {
        Ok(Ok(mut conn)) => redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok(),
        _ => false,
    }
}

/// 生成唯一的键前缀，隔离并发运行的测试
#[allow(dead_code)]
pub fn unique_prefix(name: &str) -> String {
    format!("test:{}:{}:", name, uuid::Uuid::new_v4().simple())
}

/// 基于内存存储的协调器
#[allow(dead_code)]
pub fn memory_coordinator(config: Config) -> (Arc<MemoryBackend>, Coordinator) {
    setup_logging();
    let store = Arc::new(MemoryBackend::new());
    let coordinator = Coordinator::new(config, store.clone()).expect("valid config");
    (store, coordinator)
}

/// 轮询直到条件成立或超时
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    pub id: u64,
    pub name: String,
    pub score: u32,
}

/// 统计回源次数的店铺加载器，可设置延迟和失败
#[derive(Default)]
pub struct ShopLoader {
    shops: RwLock<HashMap<u64, Shop>>,
    pub calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

#[allow(dead_code)]
impl ShopLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn put(&self, id: u64, name: &str, score: u32) {
        self.shops.write().await.insert(
            id,
            Shop {
                id,
                name: name.to_string(),
                score,
            },
        );
    }

    pub async fn remove(&self, id: u64) {
        self.shops.write().await.remove(&id);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityLoader for ShopLoader {
    type Id = u64;
    type Value = Shop;

    async fn fetch(&self, id: &u64) -> Result<Option<Shop>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(oxflash::FlashError::Store("database unavailable".to_string()));
        }
        Ok(self.shops.read().await.get(id).cloned())
    }
}
