//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了集群范围内的全局唯一ID生成器。
//!
//! ID为64位：高32位是距纪元的秒数，低32位是按前缀、按天递增的序列号。
//! 序列号由存储的原子自增产生，计数器键带日期，因此每天从1重新开始。

use crate::backend::StoreBackend;
use crate::error::{FlashError, Result};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

/// 序列号位数
pub const COUNT_BITS: u32 = 32;

/// 全局ID生成器
pub struct IdGenerator {
    store: Arc<dyn StoreBackend>,
    counter_prefix: String,
    epoch_seconds: i64,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("counter_prefix", &self.counter_prefix)
            .field("epoch_seconds", &self.epoch_seconds)
            .finish()
    }
}

impl IdGenerator {
    pub fn new(
        store: Arc<dyn StoreBackend>,
        counter_prefix: impl Into<String>,
        epoch_seconds: i64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            counter_prefix: counter_prefix.into(),
            epoch_seconds,
            metrics,
        }
    }

    /// 生成下一个ID
    #[instrument(skip(self), level = "debug")]
    pub async fn next_id(&self, key_prefix: &str) -> Result<u64> {
        self.next_id_at(key_prefix, Utc::now()).await
    }

    /// 以指定时刻生成ID
    pub async fn next_id_at(&self, key_prefix: &str, now: DateTime<Utc>) -> Result<u64> {
        let elapsed = now.timestamp() - self.epoch_seconds;
        if elapsed < 0 {
            self.metrics.record("id", "next", "clock_error");
            return Err(FlashError::Clock(format!(
                "current time {} is before the ID epoch {}",
                now.timestamp(),
                self.epoch_seconds
            )));
        }

        let key = self.counter_key(key_prefix, now);
        let sequence = self.store.incr(&key).await?;
        if sequence < 0 || sequence > u32::MAX as i64 {
            self.metrics.record("id", "next", "overflow");
            return Err(FlashError::IdOverflow {
                prefix: key_prefix.to_string(),
                sequence,
            });
        }

        self.metrics.record("id", "next", "ok");
        debug!("Allocated sequence {} from {}", sequence, key);
        Ok(((elapsed as u64) << COUNT_BITS) | sequence as u64)
    }

    /// 计数器键：`<counter_prefix><key_prefix>:<yyyy:MM:dd>`
    pub fn counter_key(&self, key_prefix: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}{}:{}",
            self.counter_prefix,
            key_prefix,
            now.format("%Y:%m:%d")
        )
    }

    /// 从ID中取出生成时刻的秒级时间戳
    pub fn timestamp_of(&self, id: u64) -> i64 {
        (id >> COUNT_BITS) as i64 + self.epoch_seconds
    }

    /// 从ID中取出序列号
    pub fn sequence_of(id: u64) -> u32 {
        (id & u32::MAX as u64) as u32
    }
}
