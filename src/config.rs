//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调组件的配置结构和解析逻辑。

use crate::error::{FlashError, Result};
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_VERSION: u32 = 1;

/// 顶层配置
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub config_version: Option<u32>,
    /// 远程存储（Redis）配置
    pub store: StoreConfig,
    /// 缓存客户端配置
    pub cache: CacheConfig,
    /// 分布式锁配置
    pub lock: LockConfig,
    /// 全局ID生成器配置
    pub id: IdConfig,
    /// 秒杀下单管道配置
    pub admission: AdmissionConfig,
    /// 订单持久化数据库配置
    pub database: DatabaseConfig,
}

/// 存储配置
///
/// 定义Redis的连接方式
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis模式
    pub mode: RedisMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
    /// Redis 密码（可选）
    pub password: Option<SecretString>,
    /// 是否启用 TLS
    pub enable_tls: bool,
    /// 哨兵配置
    pub sentinel: Option<SentinelConfig>,
    /// 集群配置
    pub cluster: Option<ClusterConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
            password: None,
            enable_tls: false,
            sentinel: None,
            cluster: None,
        }
    }
}

/// 哨兵配置
#[derive(Deserialize, Clone, Debug)]
pub struct SentinelConfig {
    /// 主节点名称
    pub master_name: String,
    /// 哨兵节点列表
    pub nodes: Vec<String>,
}

/// 集群配置
#[derive(Deserialize, Clone, Debug)]
pub struct ClusterConfig {
    /// 初始节点列表
    pub nodes: Vec<String>,
}

/// Redis模式枚举
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    /// 单机模式
    #[default]
    Standalone,
    /// 哨兵模式
    Sentinel,
    /// 集群模式
    Cluster,
}

/// 缓存客户端配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    /// 正常缓存条目的过期时间（秒）
    pub default_ttl: u64,
    /// 空值标记的过期时间（秒），必须小于 `default_ttl`
    pub null_ttl: u64,
    /// 逻辑过期重建线程数
    pub rebuild_workers: usize,
    /// 重建任务队列容量
    pub rebuild_queue_size: usize,
    /// 重建锁租期（秒）
    pub rebuild_lock_lease_secs: u64,
    /// 互斥策略下的重试间隔（毫秒）
    pub mutex_retry_interval_ms: u64,
    /// 互斥策略下的最长等待时间（毫秒）
    pub mutex_max_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: 30 * 60,
            null_ttl: 2 * 60,
            rebuild_workers: 10,
            rebuild_queue_size: 1024,
            rebuild_lock_lease_secs: 10,
            mutex_retry_interval_ms: 50,
            mutex_max_wait_ms: 5000,
        }
    }
}

/// 分布式锁配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LockConfig {
    /// 锁键前缀，租期由各调用方按用途指定
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
        }
    }
}

/// 全局ID生成器配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct IdConfig {
    /// 计数器键前缀
    pub counter_prefix: String,
    /// 纪元起点（Unix秒）
    pub epoch_seconds: i64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            counter_prefix: "icr:".to_string(),
            // 2022-01-01T00:00:00Z
            epoch_seconds: 1_640_995_200,
        }
    }
}

/// 秒杀下单管道配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AdmissionConfig {
    /// 库存键前缀
    pub stock_key_prefix: String,
    /// 已下单用户集合键前缀
    pub order_key_prefix: String,
    /// 订单消息流键
    pub stream_key: String,
    /// 消费者组名称
    pub group: String,
    /// 消费者名称
    pub consumer: String,
    /// 订单ID所用的业务前缀
    pub order_id_prefix: String,
    /// 阻塞读取超时（毫秒）
    pub block_timeout_ms: u64,
    /// pending-list 处理失败后的退避时间（毫秒）
    pub recovery_backoff_ms: u64,
    /// 用户下单锁资源前缀
    pub order_lock_prefix: String,
    /// 用户下单锁租期（秒）
    pub order_lock_lease_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            stock_key_prefix: "seckill:stock:".to_string(),
            order_key_prefix: "seckill:order:".to_string(),
            stream_key: "stream.orders".to_string(),
            group: "g1".to_string(),
            consumer: "c1".to_string(),
            order_id_prefix: "order".to_string(),
            block_timeout_ms: 2000,
            recovery_backoff_ms: 5000,
            order_lock_prefix: "order:".to_string(),
            order_lock_lease_secs: 30,
        }
    }
}

/// 订单数据库配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库连接串（sqlite / postgres / mysql）
    pub url: SecretString,
    /// 最大连接数
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: SecretString::new("sqlite::memory:".to_string().into()),
            max_connections: 10,
        }
    }
}

impl Config {
    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FlashError::Config(e.to_string()))
    }

    /// 从TOML文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保数值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(version) = self.config_version {
            if version > CONFIG_VERSION {
                return Err(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                ));
            }
        }

        let timeout = self.store.connection_timeout_ms;
        if !(100..=30000).contains(&timeout) {
            return Err("store connection_timeout_ms must be between 100 and 30000 ms".to_string());
        }
        let timeout = self.store.command_timeout_ms;
        if !(100..=60000).contains(&timeout) {
            return Err("store command_timeout_ms must be between 100 and 60000 ms".to_string());
        }
        if self.store.mode == RedisMode::Cluster && self.store.cluster.is_none() {
            return Err("store mode is cluster but [store.cluster] is missing".to_string());
        }
        if self.store.mode == RedisMode::Sentinel && self.store.sentinel.is_none() {
            return Err("store mode is sentinel but [store.sentinel] is missing".to_string());
        }

        let cache = &self.cache;
        if cache.default_ttl == 0 || cache.default_ttl > 86400 * 30 {
            return Err("cache default_ttl must be between 1 second and 30 days".to_string());
        }
        if cache.null_ttl == 0 {
            return Err("cache null_ttl cannot be zero".to_string());
        }
        if cache.null_ttl >= cache.default_ttl {
            return Err(format!(
                "cache null_ttl ({}) must be shorter than default_ttl ({})",
                cache.null_ttl, cache.default_ttl
            ));
        }
        if cache.rebuild_workers == 0 || cache.rebuild_workers > 256 {
            return Err("cache rebuild_workers must be between 1 and 256".to_string());
        }
        if cache.rebuild_queue_size == 0 {
            return Err("cache rebuild_queue_size cannot be zero".to_string());
        }
        if cache.rebuild_lock_lease_secs == 0 {
            return Err("cache rebuild_lock_lease_secs cannot be zero".to_string());
        }
        if cache.mutex_retry_interval_ms == 0 || cache.mutex_retry_interval_ms > cache.mutex_max_wait_ms
        {
            return Err(
                "cache mutex_retry_interval_ms must be non-zero and <= mutex_max_wait_ms".to_string(),
            );
        }

        if self.id.epoch_seconds < 0 {
            return Err("id epoch_seconds cannot be negative".to_string());
        }

        let admission = &self.admission;
        for (name, value) in [
            ("admission.stream_key", &admission.stream_key),
            ("admission.group", &admission.group),
            ("admission.consumer", &admission.consumer),
            ("admission.order_id_prefix", &admission.order_id_prefix),
        ] {
            if value.is_empty() {
                return Err(format!("{} cannot be empty", name));
            }
        }
        if admission.block_timeout_ms == 0 || admission.block_timeout_ms > 60000 {
            return Err("admission block_timeout_ms must be between 1 and 60000 ms".to_string());
        }
        if admission.recovery_backoff_ms == 0 {
            return Err("admission recovery_backoff_ms cannot be zero".to_string());
        }
        if admission.order_lock_lease_secs == 0 {
            return Err("admission order_lock_lease_secs cannot be zero".to_string());
        }

        let key_pattern = Regex::new(r"^[A-Za-z0-9:._\-{}]*$").map_err(|e| e.to_string())?;
        for (name, prefix) in [
            ("lock.key_prefix", &self.lock.key_prefix),
            ("id.counter_prefix", &self.id.counter_prefix),
            ("admission.stock_key_prefix", &admission.stock_key_prefix),
            ("admission.order_key_prefix", &admission.order_key_prefix),
            ("admission.stream_key", &admission.stream_key),
            ("admission.order_lock_prefix", &admission.order_lock_prefix),
        ] {
            if !key_pattern.is_match(prefix) {
                return Err(format!("{} contains unsupported characters: '{}'", name, prefix));
            }
        }

        if self.database.max_connections == 0 {
            return Err("database max_connections cannot be zero".to_string());
        }

        Ok(())
    }
}
