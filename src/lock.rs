//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于远程存储的分布式锁。
//!
//! 加锁使用 `SET key token NX PX`，解锁使用一次比较并删除的脚本调用，
//! 只有写入该令牌的持有者才能删除锁。持有者崩溃时锁在租期到达后自动失效。

use crate::backend::StoreBackend;
use crate::error::{FlashError, Result};
use crate::metrics::Metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// 已获取的锁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// 资源名（不含前缀）
    pub resource_name: String,
    /// 持有者令牌，格式 `<实例UUID>-<序号>`
    pub owner_token: String,
    /// 租期（秒）
    pub lease_seconds: u64,
    key: String,
}

impl LockHandle {
    /// 存储中的锁键
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// 分布式锁
///
/// 同一进程内的多个任务各自获得不同的令牌，因此同一实例的两个任务之间同样互斥。
pub struct DistributedLock {
    store: Arc<dyn StoreBackend>,
    key_prefix: String,
    instance_id: String,
    sequence: AtomicU64,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key_prefix", &self.key_prefix)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        key_prefix: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            instance_id: Uuid::new_v4().to_string(),
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    /// 本实例的唯一标识
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn next_token(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.instance_id, seq)
    }

    /// 尝试获取锁，不等待
    ///
    /// 锁被他人持有时返回 `Ok(None)`。
    #[instrument(skip(self), level = "debug")]
    pub async fn try_acquire(
        &self,
        resource_name: &str,
        lease_seconds: u64,
    ) -> Result<Option<LockHandle>> {
        if lease_seconds == 0 {
            return Err(FlashError::Config(
                "Lock lease must be at least one second".to_string(),
            ));
        }

        let key = format!("{}{}", self.key_prefix, resource_name);
        let token = self.next_token();
        let acquired = self
            .store
            .set_nx(&key, &token, Duration::from_secs(lease_seconds))
            .await?;

        if !acquired {
            debug!("Lock {} is held by another owner", key);
            self.metrics.record("lock", "acquire", "contended");
            return Ok(None);
        }

        self.metrics.record("lock", "acquire", "acquired");
        Ok(Some(LockHandle {
            resource_name: resource_name.to_string(),
            owner_token: token,
            lease_seconds,
            key,
        }))
    }

    /// 按固定间隔重试获取锁，直到成功或超过 `max_wait`
    ///
    /// 超时返回 `Ok(None)`。
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_with_retry(
        &self,
        resource_name: &str,
        lease_seconds: u64,
        retry_interval: Duration,
        max_wait: Duration,
    ) -> Result<Option<LockHandle>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(handle) = self.try_acquire(resource_name, lease_seconds).await? {
                return Ok(Some(handle));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(retry_interval.min(deadline - now)).await;
        }
    }

    /// 释放锁
    ///
    /// 锁已过期并被他人获得时不做任何修改，返回 `Ok(false)`。
    #[instrument(skip(self, handle), level = "debug", fields(key = %handle.key))]
    pub async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let released = self
            .store
            .release_lock(&handle.key, &handle.owner_token)
            .await?;
        if released {
            self.metrics.record("lock", "release", "released");
        } else {
            warn!(
                "Lock {} no longer owned by {}, release skipped",
                handle.key, handle.owner_token
            );
            self.metrics.record("lock", "release", "not_owner");
        }
        Ok(released)
    }
}
