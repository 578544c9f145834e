//! oxflash - 基于Redis的高并发协调组件
//!
//! 为一组无状态应用实例提供：防穿透/防击穿的旁路缓存客户端、
//! 崩溃安全的分布式锁、集群唯一ID生成器，以及基于消息流的秒杀下单管道。

#![doc(html_root_url = "https://docs.rs/oxflash/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod admission;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod id;
pub mod lock;
pub mod metrics;
pub mod serialization;
pub mod telemetry;

// Re-export commonly used items
pub use admission::{AdmissionOutcome, AdmissionPipeline, AdmissionTicket, OrderConsumer};
pub use backend::{MemoryBackend, RedisBackend, StoreBackend};
pub use cache::{CacheClient, CacheEnvelope, EntityLoader};
pub use config::Config;
pub use context::CallerContext;
pub use coordinator::Coordinator;
pub use error::{FlashError, Result};
pub use id::IdGenerator;
pub use lock::{DistributedLock, LockHandle};

/// oxflash 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
