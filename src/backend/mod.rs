//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了远程键值存储的访问接口，以及Redis与内存两种实现。
//!
//! 缓存、锁、ID生成器和秒杀管道只依赖 [`StoreBackend`]，
//! 多个应用实例之间的协调全部经由同一个存储完成。

pub mod memory;
pub mod redis_backend;
pub mod redis_provider;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// 秒杀脚本返回码：下单资格通过
pub const ADMIT_OK: i64 = 0;
/// 秒杀脚本返回码：库存不足
pub const ADMIT_NO_STOCK: i64 = 1;
/// 秒杀脚本返回码：重复下单
pub const ADMIT_DUPLICATE: i64 = 2;

/// 消息流中的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// 消息ID（"<毫秒>-<序号>"）
    pub id: String,
    /// 字段
    pub fields: HashMap<String, String>,
}

/// 消费者组读取位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// 尚未投递给组内任何消费者的新消息（`>`）
    New,
    /// 已投递给本消费者但尚未确认的消息（从 `0` 开始）
    Pending,
}

impl ReadFrom {
    pub fn as_stream_id(&self) -> &'static str {
        match self {
            ReadFrom::New => ">",
            ReadFrom::Pending => "0",
        }
    }
}

/// 秒杀脚本涉及的三个键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionKeys {
    /// 库存键
    pub stock_key: String,
    /// 已下单用户集合键
    pub order_key: String,
    /// 订单消息流键
    pub stream_key: String,
}

/// 存储后端特征
///
/// 只包含协调组件需要的原语。每个方法对应一次原子的存储操作；
/// `release_lock` 和 `admit` 在Redis中各是一次Lua脚本调用。
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// 读取字符串值，不存在时返回None
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 无条件写入，`ttl` 为None表示永不过期
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<()>;

    /// 仅当键不存在时写入，带毫秒级租期
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// 删除键
    async fn delete(&self, key: &str) -> Result<()>;

    /// 原子自增，键不存在时从0开始
    async fn incr(&self, key: &str) -> Result<i64>;

    /// 比较锁的持有者标识，相等时删除
    ///
    /// 返回是否真正删除了锁
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// 秒杀资格检查脚本
    ///
    /// 库存大于0且用户未下单时：扣减库存、记录用户、向消息流追加订单消息。
    /// 返回 [`ADMIT_OK`]、[`ADMIT_NO_STOCK`] 或 [`ADMIT_DUPLICATE`]。
    async fn admit(
        &self,
        keys: &AdmissionKeys,
        voucher_id: u64,
        user_id: u64,
        order_id: u64,
    ) -> Result<i64>;

    /// 创建消费者组（流不存在时一并创建），组已存在时视为成功
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// 以消费者组方式读取消息
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>>;

    /// 确认消息
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// 消费者组内尚未确认的消息数
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;

    /// 检查连接是否正常
    async fn ping(&self) -> Result<()>;
}
