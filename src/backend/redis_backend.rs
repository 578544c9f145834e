//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的存储后端实现。

use super::{AdmissionKeys, ReadFrom, StoreBackend, StreamEntry};
use crate::backend::redis_provider::{DefaultRedisProvider, RedisProvider};
use crate::config::{RedisMode, StoreConfig};
use crate::error::{FlashError, Result};
use async_trait::async_trait;
use redis::streams::{StreamPendingReply, StreamReadReply};
use redis::{
    aio::ConnectionManager, cluster_async::ClusterConnection, FromRedisValue, RedisResult,
    Script, ScriptInvocation,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// 比较持有者标识后删除锁
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

/// 秒杀资格检查
///
/// KEYS: 库存键、已下单用户集合键、订单消息流键
/// ARGV: 优惠券ID、用户ID、订单ID
const ADMISSION_SCRIPT: &str = r#"
local stock = tonumber(redis.call('get', KEYS[1]))
if (not stock) or stock <= 0 then
    return 1
end
if redis.call('sismember', KEYS[2], ARGV[2]) == 1 then
    return 2
end
redis.call('incrby', KEYS[1], -1)
redis.call('sadd', KEYS[2], ARGV[2])
redis.call('xadd', KEYS[3], '*', 'userId', ARGV[2], 'voucherId', ARGV[1], 'id', ARGV[3])
return 0
"#;

/// 单机/哨兵连接或集群连接
#[derive(Clone)]
enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl RedisConnection {
    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> RedisResult<T> {
        match self {
            RedisConnection::Single(manager) => cmd.query_async(&mut manager.clone()).await,
            RedisConnection::Cluster(conn) => cmd.query_async(&mut conn.clone()).await,
        }
    }

    async fn invoke<T: FromRedisValue>(&self, invocation: &ScriptInvocation<'_>) -> RedisResult<T> {
        match self {
            RedisConnection::Single(manager) => invocation.invoke_async(&mut manager.clone()).await,
            RedisConnection::Cluster(conn) => invocation.invoke_async(&mut conn.clone()).await,
        }
    }
}

/// Redis存储后端
///
/// 普通命令共用一条多路复用连接；阻塞式流读取使用单独的连接。
#[derive(Clone)]
pub struct RedisBackend {
    mode: RedisMode,
    conn: RedisConnection,
    stream_conn: RedisConnection,
    command_timeout: Duration,
    unlock_script: Script,
    admission_script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("mode", &self.mode)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisBackend {
    /// 创建新的Redis存储后端
    #[instrument(skip(config), level = "info", name = "init_redis_backend")]
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        Self::new_with_provider(config, Arc::new(DefaultRedisProvider)).await
    }

    /// 使用指定的Redis提供者创建存储后端
    #[instrument(skip(config, provider), level = "info", fields(mode = ?config.mode))]
    pub async fn new_with_provider(
        config: &StoreConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        debug!("Initializing RedisBackend with mode: {:?}", config.mode);
        let (conn, stream_conn) = match config.mode {
            RedisMode::Standalone => (
                RedisConnection::Single(provider.connect_standalone(config).await?),
                RedisConnection::Single(provider.connect_standalone(config).await?),
            ),
            RedisMode::Sentinel => (
                RedisConnection::Single(provider.connect_sentinel(config).await?),
                RedisConnection::Single(provider.connect_sentinel(config).await?),
            ),
            RedisMode::Cluster => (
                RedisConnection::Cluster(provider.connect_cluster(config).await?),
                RedisConnection::Cluster(provider.connect_cluster(config).await?),
            ),
        };

        Ok(Self {
            mode: config.mode,
            conn,
            stream_conn,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            unlock_script: Script::new(UNLOCK_SCRIPT),
            admission_script: Script::new(ADMISSION_SCRIPT),
        })
    }

    /// 获取命令超时时间
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn with_timeout<T, F>(&self, op: &str, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(FlashError::Timeout(format!(
                "Redis {} timed out after {}ms",
                op,
                limit.as_millis()
            ))),
        }
    }

    async fn query<T: FromRedisValue>(&self, op: &str, cmd: &redis::Cmd) -> Result<T> {
        self.with_timeout(op, self.command_timeout, self.conn.query(cmd))
            .await
    }
}

fn into_entries(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    let Some(reply) = reply else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in key.ids {
            let mut fields = HashMap::with_capacity(id.map.len());
            for (field, value) in &id.map {
                match redis::from_redis_value::<String>(value) {
                    Ok(v) => {
                        fields.insert(field.clone(), v);
                    }
                    Err(e) => warn!("Skipping non-string field {} of {}: {}", field, id.id, e),
                }
            }
            entries.push(StreamEntry { id: id.id, fields });
        }
    }
    entries
}

#[async_trait]
impl StoreBackend for RedisBackend {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &[u8], ttl: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl);
        }
        self.query::<()>("SET", &cmd).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let result: Option<String> = self
            .query(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms),
            )
            .await?;
        debug!("SET NX result: key={}, success={}", key, result.is_some());
        Ok(result.is_some())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<()> {
        self.query::<()>("DEL", redis::cmd("DEL").arg(key)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn incr(&self, key: &str) -> Result<i64> {
        self.query("INCR", redis::cmd("INCR").arg(key)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut invocation = self.unlock_script.prepare_invoke();
        invocation.key(key).arg(token);
        let deleted: i64 = self
            .with_timeout(
                "unlock script",
                self.command_timeout,
                self.conn.invoke(&invocation),
            )
            .await?;
        Ok(deleted == 1)
    }

    #[instrument(skip(self, keys), level = "debug")]
    async fn admit(
        &self,
        keys: &AdmissionKeys,
        voucher_id: u64,
        user_id: u64,
        order_id: u64,
    ) -> Result<i64> {
        let mut invocation = self.admission_script.prepare_invoke();
        invocation
            .key(&keys.stock_key)
            .key(&keys.order_key)
            .key(&keys.stream_key)
            .arg(voucher_id)
            .arg(user_id)
            .arg(order_id);
        self.with_timeout(
            "admission script",
            self.command_timeout,
            self.conn.invoke(&invocation),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let result: Result<()> = self
            .query(
                "XGROUP CREATE",
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg("0")
                    .arg("MKSTREAM"),
            )
            .await;
        match result {
            Err(FlashError::Redis(e)) if e.code() == Some("BUSYGROUP") => {
                debug!("Consumer group {} already exists on {}", group, stream);
                Ok(())
            }
            other => other,
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        let mut limit = self.command_timeout;
        if let (ReadFrom::New, Some(block)) = (from, block) {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
            limit += block;
        }
        cmd.arg("STREAMS").arg(stream).arg(from.as_stream_id());

        let reply: Option<StreamReadReply> = self
            .with_timeout("XREADGROUP", limit, self.stream_conn.query(&cmd))
            .await?;
        Ok(into_entries(reply))
    }

    #[instrument(skip(self), level = "debug")]
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.query::<i64>("XACK", redis::cmd("XACK").arg(stream).arg(group).arg(id))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let reply: StreamPendingReply = self
            .query("XPENDING", redis::cmd("XPENDING").arg(stream).arg(group))
            .await?;
        Ok(reply.count() as u64)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ping(&self) -> Result<()> {
        let response: String = self.query("PING", &redis::cmd("PING")).await?;
        debug!("Redis ping response: {}", response);
        Ok(())
    }
}
