//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis连接提供者接口和默认实现。

use crate::{
    config::StoreConfig,
    error::{FlashError, Result},
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, cluster_async::ClusterConnection, Client};
use secrecy::ExposeSecret;
use tokio::time::{timeout, Duration};

/// Redis连接提供者
///
/// 每次调用都建立一条独立连接。后端会为阻塞式的流读取单独申请一条，
/// 避免 `XREADGROUP BLOCK` 占住普通命令所用的多路复用连接。
#[async_trait]
pub trait RedisProvider: Send + Sync {
    async fn connect_standalone(&self, config: &StoreConfig) -> Result<ConnectionManager>;
    async fn connect_cluster(&self, config: &StoreConfig) -> Result<ClusterConnection>;
    async fn connect_sentinel(&self, config: &StoreConfig) -> Result<ConnectionManager>;
}

pub struct DefaultRedisProvider;

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    async fn connect_standalone(&self, config: &StoreConfig) -> Result<ConnectionManager> {
        let connection_string_secret = &config.connection_string;
        let connection_string = if config.enable_tls
            && !connection_string_secret
                .expose_secret()
                .starts_with("rediss://")
        {
            connection_string_secret
                .expose_secret()
                .replace("redis://", "rediss://")
        } else {
            connection_string_secret.expose_secret().to_string()
        };

        let client = Client::open(connection_string.as_str())?;
        match timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        {
            Ok(res) => Ok(res?),
            Err(_) => Err(FlashError::Timeout(format!(
                "Connection timed out after {}ms",
                config.connection_timeout_ms
            ))),
        }
    }

    async fn connect_cluster(&self, config: &StoreConfig) -> Result<ClusterConnection> {
        let cluster_config = config.cluster.as_ref().ok_or_else(|| {
            FlashError::Config("Cluster configuration is missing".to_string())
        })?;

        let mut builder = redis::cluster::ClusterClient::builder(cluster_config.nodes.clone());
        if let Some(password) = &config.password {
            builder = builder.password(password.expose_secret().to_string());
        }
        let client = builder.build()?;

        let conn = timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_async_connection(),
        )
        .await
        .map_err(|_| {
            FlashError::Timeout(format!(
                "Cluster connection timed out after {}ms",
                config.connection_timeout_ms
            ))
        })??;
        Ok(conn)
    }

    async fn connect_sentinel(&self, config: &StoreConfig) -> Result<ConnectionManager> {
        let sentinel_config = config.sentinel.as_ref().ok_or_else(|| {
            FlashError::Config("Sentinel configuration is missing".to_string())
        })?;

        tracing::info!("Initializing Sentinel client with automatic failover support");

        // redis+sentinel://[:password@]host:port[,host:port][/service_name]
        let mut url = "redis+sentinel://".to_string();
        if let Some(password) = &config.password {
            url.push_str(&format!(":{}@", password.expose_secret()));
        }

        let nodes: Vec<String> = sentinel_config
            .nodes
            .iter()
            .map(|n| {
                n.trim_start_matches("redis://")
                    .trim_start_matches("redis+sentinel://")
                    .to_string()
            })
            .collect();

        if nodes.is_empty() {
            return Err(FlashError::Config("No sentinel nodes provided".to_string()));
        }

        url.push_str(&nodes.join(","));
        url.push('/');
        url.push_str(&sentinel_config.master_name);

        let client = Client::open(url)?;
        let manager = timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| {
            FlashError::Timeout(format!(
                "Sentinel connection timed out after {}ms",
                config.connection_timeout_ms
            ))
        })??;

        Ok(manager)
    }
}
