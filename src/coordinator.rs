//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器，负责按配置构建并连接所有组件。

use crate::admission::{AdmissionPipeline, OrderConsumer, OrderRepository};
use crate::backend::{MemoryBackend, RedisBackend, StoreBackend};
use crate::cache::CacheClient;
use crate::config::Config;
use crate::error::{FlashError, Result};
use crate::id::IdGenerator;
use crate::lock::DistributedLock;
use crate::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// 协调器
///
/// 所有组件共享同一个存储和同一个指标实例，由这里显式注入。
pub struct Coordinator {
    config: Config,
    store: Arc<dyn StoreBackend>,
    metrics: Arc<Metrics>,
    lock: Arc<DistributedLock>,
    ids: Arc<IdGenerator>,
    cache: Arc<CacheClient>,
    admission: Arc<AdmissionPipeline>,
    cancel: CancellationToken,
    consumer_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("mode", &self.config.store.mode)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// 使用指定存储构建，必须在tokio运行时内调用
    #[instrument(skip(config, store), level = "info")]
    pub fn new(config: Config, store: Arc<dyn StoreBackend>) -> Result<Self> {
        config.validate().map_err(FlashError::Config)?;

        let metrics = Arc::new(Metrics::new());
        let lock = Arc::new(DistributedLock::new(
            store.clone(),
            config.lock.key_prefix.clone(),
            metrics.clone(),
        ));
        let ids = Arc::new(IdGenerator::new(
            store.clone(),
            config.id.counter_prefix.clone(),
            config.id.epoch_seconds,
            metrics.clone(),
        ));
        let cache = Arc::new(CacheClient::new(
            store.clone(),
            lock.clone(),
            config.cache.clone(),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionPipeline::new(
            store.clone(),
            ids.clone(),
            config.admission.clone(),
            metrics.clone(),
        ));

        info!("Coordinator initialized (instance {})", lock.instance_id());
        Ok(Self {
            config,
            store,
            metrics,
            lock,
            ids,
            cache,
            admission,
            cancel: CancellationToken::new(),
            consumer_handle: Mutex::new(None),
        })
    }

    /// 连接Redis并构建
    pub async fn connect(config: Config) -> Result<Self> {
        let store = Arc::new(RedisBackend::new(&config.store).await?);
        Self::new(config, store)
    }

    /// 使用进程内存储构建
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::new(config, Arc::new(MemoryBackend::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StoreBackend> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn lock(&self) -> Arc<DistributedLock> {
        self.lock.clone()
    }

    pub fn ids(&self) -> Arc<IdGenerator> {
        self.ids.clone()
    }

    pub fn cache(&self) -> Arc<CacheClient> {
        self.cache.clone()
    }

    pub fn admission(&self) -> Arc<AdmissionPipeline> {
        self.admission.clone()
    }

    /// 创建消费者组并在后台启动订单消费者
    #[instrument(skip(self, repository), level = "info")]
    pub async fn start_consumer(&self, repository: Arc<dyn OrderRepository>) -> Result<()> {
        let mut handle = self.consumer_handle.lock().await;
        if handle.is_some() {
            return Err(FlashError::NotSupported(
                "order consumer already started".to_string(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(FlashError::Shutdown("coordinator is shut down".to_string()));
        }

        self.admission.init().await?;
        let consumer = Arc::new(OrderConsumer::new(
            self.store.clone(),
            self.lock.clone(),
            repository,
            self.config.admission.clone(),
            self.metrics.clone(),
            self.cancel.child_token(),
        ));
        *handle = Some(consumer.spawn());
        Ok(())
    }

    /// 停止订单消费者和重建工作池
    #[instrument(skip(self), level = "info")]
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.consumer_handle.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(result) => result?,
                Err(e) => {
                    error!("Order consumer task failed: {}", e);
                    return Err(FlashError::Shutdown(e.to_string()));
                }
            }
        }
        self.cache.shutdown().await;
        info!("Coordinator shut down");
        Ok(())
    }
}
