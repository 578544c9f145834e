//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了旁路缓存客户端，提供防缓存穿透与防缓存击穿的读取策略。
//!
//! - 穿透：不存在的实体写入短TTL的空值标记，TTL内不再回源。
//! - 击穿（互斥锁）：未命中时只有拿到键锁的调用方回源，其余调用方短暂等待后重读。
//! - 击穿（逻辑过期）：值永不在存储中过期，过期后由一个后台任务重建，其余调用方直接返回旧值。

pub mod envelope;
pub mod loader;
pub mod rebuild;

use crate::backend::StoreBackend;
use crate::config::CacheConfig;
use crate::error::{FlashError, Result};
use crate::lock::{DistributedLock, LockHandle};
use crate::metrics::Metrics;
use crate::serialization::{Serializer, SerializerEnum};
use envelope::CachedValue;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

pub use envelope::CacheEnvelope;
pub use loader::EntityLoader;
pub use rebuild::RebuildPool;

/// 旁路缓存客户端
pub struct CacheClient {
    store: Arc<dyn StoreBackend>,
    lock: Arc<DistributedLock>,
    serializer: SerializerEnum,
    rebuild_pool: RebuildPool,
    config: CacheConfig,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn cache_key(key_prefix: &str, id: &impl Display) -> String {
    format!("{}{}", key_prefix, id)
}

/// 存储TTL按整秒计，不足一秒的部分向上取整，最短一秒
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

impl CacheClient {
    /// 创建缓存客户端并启动重建工作池，必须在tokio运行时内调用
    pub fn new(
        store: Arc<dyn StoreBackend>,
        lock: Arc<DistributedLock>,
        config: CacheConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rebuild_pool = RebuildPool::new(config.rebuild_workers, config.rebuild_queue_size);
        Self {
            store,
            lock,
            serializer: SerializerEnum::default(),
            rebuild_pool,
            config,
            metrics,
        }
    }

    /// 默认TTL
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl)
    }

    async fn lookup(&self, key: &str) -> Result<CachedValue> {
        Ok(CachedValue::from_raw(self.store.get(key).await?))
    }

    /// 回源并写入缓存：实体存在写正常值，不存在写空值标记
    async fn fill<L: EntityLoader>(
        &self,
        key: &str,
        id: &L::Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<L::Value>> {
        self.metrics.record("cache", "fetch", "called");
        match loader.fetch(id).await? {
            Some(value) => {
                let bytes = self.serializer.serialize(&value)?;
                self.store.set(key, &bytes, Some(ttl_secs(ttl))).await?;
                Ok(Some(value))
            }
            None => {
                debug!("Entity {} absent, caching null marker", key);
                self.store
                    .set(key, b"", Some(self.config.null_ttl.max(1)))
                    .await?;
                self.metrics.record("cache", "null_marker", "written");
                Ok(None)
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, cached: CachedValue) -> Result<Option<T>> {
        match cached {
            CachedValue::Present(bytes) => {
                self.metrics.record("cache", "get", "hit");
                Ok(Some(self.serializer.deserialize(&bytes)?))
            }
            CachedValue::Null => {
                self.metrics.record("cache", "get", "null");
                Ok(None)
            }
            CachedValue::Missing => Ok(None),
        }
    }

    async fn release_quietly(&self, handle: &LockHandle) {
        if let Err(e) = self.lock.release(handle).await {
            warn!("Failed to release cache lock {}: {}", handle.key(), e);
        }
    }

    /// 防穿透读取
    ///
    /// 命中空值标记时直接返回 `None`，不回源。
    /// `ttl` 以整秒写入存储，不足一秒向上取整。
    #[instrument(skip(self, loader, id), level = "debug", fields(id = %id))]
    pub async fn get_with_pass_through<L: EntityLoader>(
        &self,
        key_prefix: &str,
        id: &L::Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<L::Value>> {
        let key = cache_key(key_prefix, id);
        match self.lookup(&key).await? {
            CachedValue::Missing => {
                self.metrics.record("cache", "get", "miss");
                self.fill(&key, id, loader, ttl).await
            }
            cached => self.decode(cached),
        }
    }

    /// 互斥锁方式防击穿读取
    ///
    /// 未命中时争抢键锁；抢不到则按重试间隔休眠后重新读取整个缓存，
    /// 超过最长等待时间返回 [`FlashError::Timeout`]。
    #[instrument(skip(self, loader, id), level = "debug", fields(id = %id))]
    pub async fn get_with_mutex<L: EntityLoader>(
        &self,
        key_prefix: &str,
        id: &L::Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<L::Value>> {
        let key = cache_key(key_prefix, id);
        let retry_interval = Duration::from_millis(self.config.mutex_retry_interval_ms);
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.mutex_max_wait_ms);

        loop {
            let cached = self.lookup(&key).await?;
            if cached != CachedValue::Missing {
                return self.decode(cached);
            }

            let Some(handle) = self
                .lock
                .try_acquire(&key, self.config.rebuild_lock_lease_secs)
                .await?
            else {
                if tokio::time::Instant::now() >= deadline {
                    self.metrics.record("cache", "mutex", "timeout");
                    return Err(FlashError::Timeout(format!(
                        "waited {}ms for cache rebuild of {}",
                        self.config.mutex_max_wait_ms, key
                    )));
                }
                tokio::time::sleep(retry_interval).await;
                continue;
            };

            // 拿到锁后再确认一次，前一个持有者可能刚写完
            let result = match self.lookup(&key).await {
                Ok(CachedValue::Missing) => {
                    self.metrics.record("cache", "get", "miss");
                    self.fill(&key, id, loader, ttl).await
                }
                Ok(cached) => self.decode(cached),
                Err(e) => Err(e),
            };
            self.release_quietly(&handle).await;
            return result;
        }
    }

    /// 逻辑过期方式防击穿读取
    ///
    /// 从不同步回源：信封不存在返回 `None`（需预先调用 [`CacheClient::warm`]）；
    /// 已过期时最多提交一个后台重建任务，调用方立即得到旧值。
    #[instrument(skip(self, loader, id), level = "debug", fields(id = %id))]
    pub async fn get_with_logical_expire<L: EntityLoader>(
        &self,
        key_prefix: &str,
        id: &L::Id,
        loader: Arc<L>,
        rebuild_ttl: Duration,
    ) -> Result<Option<L::Value>> {
        let key = cache_key(key_prefix, id);
        let bytes = match self.lookup(&key).await? {
            CachedValue::Present(bytes) => bytes,
            CachedValue::Missing | CachedValue::Null => {
                self.metrics.record("cache", "logical", "miss");
                return Ok(None);
            }
        };
        let envelope: CacheEnvelope<L::Value> = self.serializer.deserialize(&bytes)?;
        if !envelope.is_expired() {
            self.metrics.record("cache", "logical", "fresh");
            return Ok(envelope.data);
        }

        let Some(handle) = self
            .lock
            .try_acquire(&key, self.config.rebuild_lock_lease_secs)
            .await?
        else {
            self.metrics.record("cache", "logical", "stale");
            return Ok(envelope.data);
        };

        // 二次检查：其他实例可能已经完成重建并释放了锁
        match self.lookup(&key).await {
            Ok(CachedValue::Present(bytes)) => {
                match self.serializer.deserialize::<CacheEnvelope<L::Value>>(&bytes) {
                    Ok(current) if !current.is_expired() => {
                        self.release_quietly(&handle).await;
                        self.metrics.record("cache", "logical", "fresh");
                        return Ok(current.data);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Envelope at {} unreadable on re-check: {}", key, e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.release_quietly(&handle).await;
                return Err(e);
            }
        }

        let job = rebuild_job(
            self.store.clone(),
            self.lock.clone(),
            self.serializer.clone(),
            self.metrics.clone(),
            loader,
            id.clone(),
            key.clone(),
            handle.clone(),
            rebuild_ttl,
        );
        match self.rebuild_pool.submit(job).await {
            Ok(()) => self.metrics.record("cache", "rebuild", "submitted"),
            Err(e) => {
                warn!("Rebuild of {} not scheduled: {}", key, e);
                self.metrics.record("cache", "rebuild", "rejected");
                self.release_quietly(&handle).await;
            }
        }
        Ok(envelope.data)
    }

    /// 无条件写入正常值
    ///
    /// `ttl` 的粒度为一秒：不足一秒的部分向上取整，`Duration::ZERO` 按一秒处理。
    #[instrument(skip(self, value, id), level = "debug", fields(id = %id))]
    pub async fn set<T: Serialize + Sync>(
        &self,
        key_prefix: &str,
        id: impl Display + Send,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let bytes = self.serializer.serialize(value)?;
        self.store
            .set(&cache_key(key_prefix, &id), &bytes, Some(ttl_secs(ttl)))
            .await
    }

    /// 写入逻辑过期信封，存储中不设TTL
    #[instrument(skip(self, value, id), level = "debug", fields(id = %id))]
    pub async fn set_with_logical_expire<T: Serialize + Sync>(
        &self,
        key_prefix: &str,
        id: impl Display + Send,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let envelope = CacheEnvelope::new(Some(value), ttl);
        let bytes = self.serializer.serialize(&envelope)?;
        self.store
            .set(&cache_key(key_prefix, &id), &bytes, None)
            .await
    }

    /// 预热逻辑过期键
    ///
    /// 回源后写入信封（实体不存在时 `data` 为null），返回实体是否存在。
    #[instrument(skip(self, loader, id), level = "debug", fields(id = %id))]
    pub async fn warm<L: EntityLoader>(
        &self,
        key_prefix: &str,
        id: &L::Id,
        loader: &L,
        ttl: Duration,
    ) -> Result<bool> {
        let value = loader.fetch(id).await?;
        let exists = value.is_some();
        let envelope = CacheEnvelope::new(value, ttl);
        let bytes = self.serializer.serialize(&envelope)?;
        self.store
            .set(&cache_key(key_prefix, id), &bytes, None)
            .await?;
        self.metrics.record("cache", "warm", "done");
        Ok(exists)
    }

    /// 实体更新后删除缓存
    #[instrument(skip(self, id), level = "debug", fields(id = %id))]
    pub async fn invalidate(&self, key_prefix: &str, id: impl Display + Send) -> Result<()> {
        self.store.delete(&cache_key(key_prefix, &id)).await?;
        self.metrics.record("cache", "invalidate", "done");
        Ok(())
    }

    /// 停止接收重建任务并等待已排队的任务完成
    pub async fn shutdown(&self) {
        self.rebuild_pool.shutdown().await;
    }
}

/// 后台重建：回源、写入新信封，所有路径上都释放重建锁
#[allow(clippy::too_many_arguments)]
async fn rebuild_job<L: EntityLoader>(
    store: Arc<dyn StoreBackend>,
    lock: Arc<DistributedLock>,
    serializer: SerializerEnum,
    metrics: Arc<Metrics>,
    loader: Arc<L>,
    id: L::Id,
    key: String,
    handle: LockHandle,
    ttl: Duration,
) {
    let outcome: Result<()> = async {
        let value = loader.fetch(&id).await?;
        let envelope = CacheEnvelope::new(value, ttl);
        let bytes = serializer.serialize(&envelope)?;
        store.set(&key, &bytes, None).await
    }
    .await;

    match outcome {
        Ok(()) => {
            debug!("Rebuilt logical-expire entry {}", key);
            metrics.record("cache", "rebuild", "done");
        }
        Err(e) => {
            error!("Rebuild of {} failed: {}", key, e);
            metrics.record("cache", "rebuild", "failed");
        }
    }

    if let Err(e) = lock.release(&handle).await {
        warn!("Failed to release rebuild lock {}: {}", handle.key(), e);
    }
}
