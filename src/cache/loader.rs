//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存未命中时的数据加载接口。

use crate::error::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;

/// 实体加载器
///
/// 缓存客户端在未命中或重建时调用，通常由持有数据库的服务实现。
/// 返回 `Ok(None)` 表示实体不存在，缓存会写入空值标记。
#[async_trait]
pub trait EntityLoader: Send + Sync + 'static {
    /// 实体ID，与键前缀拼接成缓存键
    type Id: Display + Clone + Send + Sync + 'static;
    /// 实体类型
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    async fn fetch(&self, id: &Self::Id) -> Result<Option<Self::Value>>;
}
