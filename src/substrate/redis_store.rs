//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的KV基座实现。
//!
//! 条件写入和计数器用 Lua 脚本保证原子性，定长列表用 MULTI 事务把压入与裁剪合为一步，
//! 列表整体替换同样放在一个事务里，
//! 每条命令都受 `command_timeout_ms` 约束。

use super::redis_provider::{DefaultRedisProvider, RedisProvider};
use super::KvSubstrate;
use crate::config::{RedisConfig, RedisMode};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::{aio::ConnectionManager, cluster_async::ClusterConnection, FromRedisValue, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const SCAN_BATCH: usize = 200;

lazy_static! {
    static ref COMPARE_AND_SWAP: Script = Script::new(
        r#"
        local current = redis.call('GET', KEYS[1])
        if ARGV[1] == '1' then
            if current ~= ARGV[2] then
                return 0
            end
        elseif current then
            return 0
        end
        if tonumber(ARGV[4]) > 0 then
            redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
        else
            redis.call('SET', KEYS[1], ARGV[3])
        end
        return 1
        "#
    );
    static ref DELETE_IF_EQUALS: Script = Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        else
            return 0
        end
        "#
    );
    static ref INCREMENT: Script = Script::new(
        r#"
        local value = redis.call('INCRBY', KEYS[1], ARGV[1])
        if tonumber(ARGV[2]) > 0 and redis.call('PTTL', KEYS[1]) == -1 then
            redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return value
        "#
    );
    static ref INCREMENT_EXISTING: Script = Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return redis.call('INCRBY', KEYS[1], ARGV[1])
        end
        return false
        "#
    );
}

#[derive(Clone)]
enum Connection {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Redis KV基座
#[derive(Clone)]
pub struct RedisSubstrate {
    connection: Connection,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.connection {
            Connection::Standalone(_) => write!(f, "RedisSubstrate::Standalone"),
            Connection::Cluster(_) => write!(f, "RedisSubstrate::Cluster"),
        }
    }
}

/// 在当前连接上执行一次请求，并套上命令超时
macro_rules! on_conn {
    ($self:ident, $conn:ident => $call:expr) => {{
        let request = async {
            match $self.connection.clone() {
                Connection::Standalone(mut $conn) => $call.await,
                Connection::Cluster(mut $conn) => $call.await,
            }
        };
        match tokio::time::timeout($self.command_timeout, request).await {
            Ok(res) => res.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(format!(
                "redis command exceeded {}ms",
                $self.command_timeout.as_millis()
            ))),
        }
    }};
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|ttl| (ttl.as_millis() as u64).max(1)).unwrap_or(0)
}

/// 转义 SCAN MATCH 的通配符
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

impl RedisSubstrate {
    /// 根据配置连接Redis
    #[instrument(skip(config), level = "info", name = "init_redis_substrate", fields(mode = ?config.mode))]
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        Self::connect_with_provider(config, Arc::new(DefaultRedisProvider)).await
    }

    /// 使用指定的连接提供者连接Redis
    ///
    /// # 参数
    ///
    /// * `config` - Redis连接配置
    /// * `provider` - 连接提供者
    ///
    /// # 返回值
    ///
    /// 返回新的基座实例或错误
    pub async fn connect_with_provider(
        config: &RedisConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let connection = match config.mode {
            RedisMode::Standalone => {
                Connection::Standalone(provider.get_standalone_connection(config).await?)
            }
            RedisMode::Cluster => {
                Connection::Cluster(provider.get_cluster_connection(config).await?)
            }
        };
        Ok(Self {
            connection,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        on_conn!(self, conn => cmd.query_async(&mut conn))
    }

    async fn query_pipe<T: FromRedisValue>(&self, pipe: &redis::Pipeline) -> Result<T> {
        on_conn!(self, conn => pipe.query_async(&mut conn))
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T> {
        on_conn!(self, conn => invocation.invoke_async(&mut conn))
    }
}

#[async_trait]
impl KvSubstrate for RedisSubstrate {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.query(&cmd).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.query(redis::cmd("EXISTS").arg(key)).await
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let result: Option<String> = self.query(&cmd).await?;
        debug!(acquired = result.is_some(), "SET NX result");
        Ok(result.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut invocation = COMPARE_AND_SWAP.prepare_invoke();
        invocation
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(ttl_millis(ttl));
        let swapped: i64 = self.invoke(&invocation).await?;
        Ok(swapped == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut invocation = DELETE_IF_EQUALS.prepare_invoke();
        invocation.key(key).arg(expected);
        let removed: i64 = self.invoke(&invocation).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut invocation = INCREMENT.prepare_invoke();
        invocation.key(key).arg(delta).arg(ttl_millis(ttl));
        self.invoke(&invocation).await
    }

    async fn increment_existing(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let mut invocation = INCREMENT_EXISTING.prepare_invoke();
        invocation.key(key).arg(delta);
        self.invoke(&invocation).await
    }

    #[instrument(skip(self, values), level = "debug", fields(count = values.len()))]
    async fn push_capped(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if capacity == 0 {
            return Err(CacheError::InvalidArgument(
                "capacity must be positive".to_string(),
            ));
        }
        if values.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(values)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(capacity as i64 - 1)
            .ignore();
        if ttl.is_some() {
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
        }
        self.query_pipe(&pipe).await
    }

    #[instrument(skip(self, values), level = "debug", fields(count = values.len()))]
    async fn list_replace(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !values.is_empty() {
            pipe.cmd("RPUSH").arg(key).arg(values).ignore();
            if ttl.is_some() {
                pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
            }
        }
        self.query_pipe(&pipe).await
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<Vec<u8>>> {
        if end <= start {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(end - 1))
            .await
    }

    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(0).arg(-1))
            .await
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            for key in keys {
                let count: i64 = self.query(redis::cmd("DEL").arg(&key)).await?;
                removed += count.max(0) as u64;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(removed, "deleted keys by prefix");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
