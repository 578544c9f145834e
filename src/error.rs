//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调组件（缓存、锁、ID、秒杀下单）的错误类型。

use thiserror::Error;

/// 错误类型枚举
///
/// "未找到" 与 "竞争失败" 不属于错误：前者以 `Ok(None)` 表示，
/// 后者以 `Ok(None)` 或结果枚举表示。这里只保留真正需要调用方处理的失败。
#[derive(Error, Debug)]
pub enum FlashError {
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 存储操作失败
    #[error("Store operation failed: {0}")]
    Store(String),

    /// Redis错误
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Sea-ORM数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 操作不支持
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 每日序列号超出32位容量
    #[error("ID sequence overflow for prefix '{prefix}': {sequence} exceeds 32 bits")]
    IdOverflow { prefix: String, sequence: i64 },

    /// 系统时钟早于ID纪元
    #[error("Clock error: {0}")]
    Clock(String),

    /// 无法解析的下单消息
    #[error("Invalid admission ticket: {0}")]
    InvalidTicket(String),

    /// 消费者持久化阶段的锁竞争
    #[error("Lock contention on '{0}'")]
    LockContention(String),

    /// 后台队列已满，任务被拒绝
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// 数据库库存乐观更新失败
    #[error("Stock unavailable for voucher {0}")]
    StockUnavailable(u64),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// 操作结果类型别名
pub type Result<T> = std::result::Result<T, FlashError>;
