//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了Redis连接提供者接口和默认实现。

use crate::{
    config::RedisConfig,
    error::{CacheError, Result},
    utils::redact_connection_string,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, cluster_async::ClusterConnection, Client};
use secrecy::ExposeSecret;
use tokio::time::{timeout, Duration};
use tracing::info;

/// Redis连接提供者
///
/// 把建立连接的细节与基座实现分开，便于在测试中替换。
#[async_trait]
pub trait RedisProvider: Send + Sync {
    async fn get_standalone_connection(&self, config: &RedisConfig) -> Result<ConnectionManager>;
    async fn get_cluster_connection(&self, config: &RedisConfig) -> Result<ClusterConnection>;
}

pub struct DefaultRedisProvider;

fn connection_url(config: &RedisConfig) -> String {
    let raw = config.connection_string.expose_secret();
    if config.enable_tls && !raw.starts_with("rediss://") {
        raw.replace("redis://", "rediss://")
    } else {
        raw.to_string()
    }
}

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    async fn get_standalone_connection(&self, config: &RedisConfig) -> Result<ConnectionManager> {
        let url = connection_url(config);
        let client = Client::open(url.as_str())?;
        match timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_connection_manager(),
        )
        .await
        {
            Ok(res) => {
                let manager = res?;
                info!(endpoint = %redact_connection_string(&url), "connected to redis");
                Ok(manager)
            }
            Err(_) => Err(CacheError::Timeout(format!(
                "Connection timed out after {}ms. Target: {}",
                config.connection_timeout_ms,
                redact_connection_string(&url)
            ))),
        }
    }

    async fn get_cluster_connection(&self, config: &RedisConfig) -> Result<ClusterConnection> {
        let cluster_config = config.cluster.as_ref().ok_or_else(|| {
            CacheError::Configuration("Cluster configuration is missing".to_string())
        })?;

        let nodes: Vec<String> = cluster_config
            .nodes
            .iter()
            .map(|node| {
                let url = if node.contains("://") {
                    node.clone()
                } else {
                    format!("redis://{}", node)
                };
                if config.enable_tls {
                    url.replace("redis://", "rediss://")
                } else {
                    url
                }
            })
            .collect();

        let mut builder = redis::cluster::ClusterClient::builder(nodes);
        if let Some(password) = &config.password {
            builder = builder.password(password.expose_secret().to_string());
        }
        let client = builder.build()?;

        let connection = timeout(
            Duration::from_millis(config.connection_timeout_ms),
            client.get_async_connection(),
        )
        .await
        .map_err(|_| {
            CacheError::Timeout(format!(
                "Cluster connection timed out after {}ms",
                config.connection_timeout_ms
            ))
        })??;
        info!(nodes = cluster_config.nodes.len(), "connected to redis cluster");
        Ok(connection)
    }
}
