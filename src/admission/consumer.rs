//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单消息流的消费者。
//!
//! 消息只在订单落库（或确认重复）之后才确认，因此进程在处理中途崩溃时，
//! 消息留在消费者组的pending列表中，下次启动或出错后会被重新处理。

use super::repository::{OrderCommit, OrderRepository, VoucherOrder};
use super::AdmissionTicket;
use crate::backend::{ReadFrom, StoreBackend, StreamEntry};
use crate::config::AdmissionConfig;
use crate::error::{FlashError, Result};
use crate::lock::DistributedLock;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 订单消费者
pub struct OrderConsumer {
    store: Arc<dyn StoreBackend>,
    lock: Arc<DistributedLock>,
    repository: Arc<dyn OrderRepository>,
    config: AdmissionConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for OrderConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderConsumer")
            .field("stream", &self.config.stream_key)
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .finish()
    }
}

impl OrderConsumer {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        lock: Arc<DistributedLock>,
        repository: Arc<dyn OrderRepository>,
        config: AdmissionConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            lock,
            repository,
            config,
            metrics,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 在后台任务中运行
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// 主循环，直到取消令牌触发
    ///
    /// 启动时先清空pending列表；之后每次读取或处理出错都再清空一次。
    pub async fn run(&self) -> Result<()> {
        info!(
            "Order consumer {} started on {}/{}",
            self.config.consumer, self.config.stream_key, self.config.group
        );
        self.drain_pending().await;

        let block = Duration::from_millis(self.config.block_timeout_ms);
        while !self.cancel.is_cancelled() {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.store.read_group(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    ReadFrom::New,
                    1,
                    Some(block),
                ) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        if let Err(e) = self.process(&entry).await {
                            error!("Failed to process order message {}: {}", entry.id, e);
                            self.metrics.record("consumer", "process", "failed");
                            self.drain_pending().await;
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read order stream: {}", e);
                    self.drain_pending().await;
                }
            }
        }

        info!("Order consumer {} stopped", self.config.consumer);
        Ok(())
    }

    /// 逐条重放本消费者的pending消息，直到为空或收到取消
    #[instrument(skip(self), level = "debug")]
    pub async fn drain_pending(&self) {
        let backoff = Duration::from_millis(self.config.recovery_backoff_ms);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let read = self
                .store
                .read_group(
                    &self.config.stream_key,
                    &self.config.group,
                    &self.config.consumer,
                    ReadFrom::Pending,
                    1,
                    None,
                )
                .await;

            let failed = match read {
                Ok(entries) if entries.is_empty() => {
                    debug!("Pending list is empty");
                    return;
                }
                Ok(entries) => {
                    let mut failed = false;
                    for entry in entries {
                        self.metrics.record("consumer", "pending", "replayed");
                        if let Err(e) = self.process(&entry).await {
                            error!("Failed to replay pending message {}: {}", entry.id, e);
                            failed = true;
                        }
                    }
                    failed
                }
                Err(e) => {
                    error!("Failed to read pending list: {}", e);
                    true
                }
            };

            if failed {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    /// 处理一条消息并在成功后确认
    ///
    /// 无法解析的消息记录日志后直接确认，避免阻塞pending列表。
    async fn process(&self, entry: &StreamEntry) -> Result<()> {
        match AdmissionTicket::from_fields(&entry.fields) {
            Ok(ticket) => {
                self.handle_ticket(&ticket).await?;
            }
            Err(e) => {
                warn!("Dropping malformed order message {}: {}", entry.id, e);
                self.metrics.record("consumer", "process", "poison");
            }
        }
        self.store
            .ack(&self.config.stream_key, &self.config.group, &entry.id)
            .await
    }

    /// 在用户锁保护下落库
    ///
    /// 抢不到锁返回 [`FlashError::LockContention`]，消息保持pending等待重放。
    #[instrument(skip(self), level = "debug")]
    pub async fn handle_ticket(&self, ticket: &AdmissionTicket) -> Result<OrderCommit> {
        let resource = format!("{}{}", self.config.order_lock_prefix, ticket.user_id);
        let Some(handle) = self
            .lock
            .try_acquire(&resource, self.config.order_lock_lease_secs)
            .await?
        else {
            self.metrics.record("consumer", "order", "lock_contended");
            return Err(FlashError::LockContention(resource));
        };

        let result = self
            .repository
            .create_order(&VoucherOrder::from_ticket(ticket))
            .await;

        if let Err(e) = self.lock.release(&handle).await {
            warn!("Failed to release order lock {}: {}", handle.key(), e);
        }

        match &result {
            Ok(OrderCommit::Created) => {
                debug!("Order {} persisted", ticket.order_id);
                self.metrics.record("consumer", "order", "persisted");
            }
            Ok(OrderCommit::AlreadyExists) => {
                warn!(
                    "User {} already holds an order for voucher {}, skipping {}",
                    ticket.user_id, ticket.voucher_id, ticket.order_id
                );
                self.metrics.record("consumer", "order", "duplicate");
            }
            Err(_) => self.metrics.record("consumer", "order", "failed"),
        }
        result
    }
}
