//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了秒杀下单管道。
//!
//! 同步阶段只在存储中执行一次原子脚本（库存检查、一人一单检查、扣减、入队），
//! 订单号立即返回给调用方；数据库写入由 [`consumer::OrderConsumer`] 异步完成。

pub mod consumer;
pub mod repository;

use crate::backend::{AdmissionKeys, StoreBackend, ADMIT_DUPLICATE, ADMIT_NO_STOCK, ADMIT_OK};
use crate::config::AdmissionConfig;
use crate::context::CallerContext;
use crate::error::{FlashError, Result};
use crate::id::IdGenerator;
use crate::metrics::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub use consumer::OrderConsumer;
pub use repository::{OrderCommit, OrderRepository, SeaOrmOrderRepository, VoucherOrder};

/// 下单结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// 获得下单资格，订单号已分配，订单将异步落库
    Admitted { order_id: u64 },
    /// 库存不足
    InsufficientStock,
    /// 该用户已经下过单
    DuplicateOrder,
}

/// 消息流中的下单凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub voucher_id: u64,
    pub user_id: u64,
    pub order_id: u64,
}

impl AdmissionTicket {
    /// 从消息字段 `voucherId`、`userId`、`id` 解析
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let field = |name: &str| -> Result<u64> {
            let raw = fields
                .get(name)
                .ok_or_else(|| FlashError::InvalidTicket(format!("missing field '{}'", name)))?;
            raw.trim().parse::<u64>().map_err(|_| {
                FlashError::InvalidTicket(format!("field '{}' is not an integer: {}", name, raw))
            })
        };
        Ok(Self {
            voucher_id: field("voucherId")?,
            user_id: field("userId")?,
            order_id: field("id")?,
        })
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("voucherId".to_string(), self.voucher_id.to_string()),
            ("userId".to_string(), self.user_id.to_string()),
            ("id".to_string(), self.order_id.to_string()),
        ])
    }
}

/// 秒杀下单管道
pub struct AdmissionPipeline {
    store: Arc<dyn StoreBackend>,
    ids: Arc<IdGenerator>,
    config: AdmissionConfig,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionPipeline {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        ids: Arc<IdGenerator>,
        config: AdmissionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            ids,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// 某张券对应的库存键、已下单用户集合键和消息流键
    pub fn keys(&self, voucher_id: u64) -> AdmissionKeys {
        AdmissionKeys {
            stock_key: format!("{}{}", self.config.stock_key_prefix, voucher_id),
            order_key: format!("{}{}", self.config.order_key_prefix, voucher_id),
            stream_key: self.config.stream_key.clone(),
        }
    }

    /// 创建订单消息流的消费者组
    #[instrument(skip(self), level = "info")]
    pub async fn init(&self) -> Result<()> {
        self.store
            .create_group(&self.config.stream_key, &self.config.group)
            .await?;
        info!(
            "Consumer group {} ready on {}",
            self.config.group, self.config.stream_key
        );
        Ok(())
    }

    /// 写入秒杀券的可售库存，通常在创建秒杀券时调用
    #[instrument(skip(self), level = "debug")]
    pub async fn load_stock(&self, voucher_id: u64, stock: u64) -> Result<()> {
        let key = self.keys(voucher_id).stock_key;
        self.store
            .set(&key, stock.to_string().as_bytes(), None)
            .await
    }

    /// 查询存储中的剩余库存
    pub async fn stock(&self, voucher_id: u64) -> Result<Option<i64>> {
        let key = self.keys(voucher_id).stock_key;
        match self.store.get(&key).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                text.trim().parse::<i64>().map(Some).map_err(|_| {
                    FlashError::Store(format!("stock at {} is not an integer: {}", key, text))
                })
            }
            None => Ok(None),
        }
    }

    /// 提交下单请求
    #[instrument(skip(self, ctx), level = "debug", fields(user_id = ctx.user_id))]
    pub async fn submit(&self, ctx: &CallerContext, voucher_id: u64) -> Result<AdmissionOutcome> {
        let order_id = self.ids.next_id(&self.config.order_id_prefix).await?;
        let code = self
            .store
            .admit(&self.keys(voucher_id), voucher_id, ctx.user_id, order_id)
            .await?;

        let outcome = match code {
            ADMIT_OK => AdmissionOutcome::Admitted { order_id },
            ADMIT_NO_STOCK => AdmissionOutcome::InsufficientStock,
            ADMIT_DUPLICATE => AdmissionOutcome::DuplicateOrder,
            other => {
                return Err(FlashError::Store(format!(
                    "unexpected admission script result {}",
                    other
                )))
            }
        };

        let label = match outcome {
            AdmissionOutcome::Admitted { .. } => "admitted",
            AdmissionOutcome::InsufficientStock => "insufficient_stock",
            AdmissionOutcome::DuplicateOrder => "duplicate",
        };
        self.metrics.record("admission", "submit", label);
        debug!("Admission for voucher {}: {:?}", voucher_id, outcome);
        Ok(outcome)
    }

    /// 已投递但尚未确认的订单消息数
    pub async fn pending_count(&self) -> Result<u64> {
        self.store
            .pending_count(&self.config.stream_key, &self.config.group)
            .await
    }
}
