//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了逻辑过期策略使用的缓存信封。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 逻辑过期信封
///
/// 存储格式为JSON `{"data": ..., "expireTime": ...}`。信封本身不设存储TTL，
/// 过期只由 `expireTime` 判断，因此过期后的值仍可作为旧值返回。
/// 重建时发现实体不存在，`data` 写为 `null`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope<T> {
    pub data: Option<T>,
    pub expire_time: DateTime<Utc>,
}

impl<T> CacheEnvelope<T> {
    /// 以当前时刻加上 `ttl` 作为逻辑过期时间
    pub fn new(data: Option<T>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expire_time = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { data, expire_time }
    }

    /// 过期时间不晚于 `now` 即视为过期
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// 缓存中原始值的三种状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CachedValue {
    /// 键不存在
    Missing,
    /// 空值标记
    Null,
    /// 正常值的原始字节
    Present(Vec<u8>),
}

impl CachedValue {
    /// 空字符串或仅含空白的值视为空值标记
    pub(crate) fn from_raw(raw: Option<Vec<u8>>) -> Self {
        match raw {
            None => CachedValue::Missing,
            Some(bytes) if is_null_marker(&bytes) => CachedValue::Null,
            Some(bytes) => CachedValue::Present(bytes),
        }
    }
}

pub(crate) fn is_null_marker(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}
