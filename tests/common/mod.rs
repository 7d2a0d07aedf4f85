//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

#![allow(dead_code)]

use async_trait::async_trait;
use oxcoord::config::{LockOptions, RedisConfig};
use oxcoord::{CacheContext, CacheError, KvSubstrate, MemorySubstrate, RedisSubstrate, Result};
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use oxcoord::utils::setup_logging;

/// 生成唯一的缓存名称
///
/// 在基础名称后附加UUID，确保共享 Redis 的测试之间互不干扰
pub fn unique_name(base: &str) -> String {
    oxcoord::utils::generate_unique_name(base)
}

/// 测试用的快速锁参数
pub fn fast_lock() -> LockOptions {
    LockOptions {
        lease_ms: 2_000,
        wait_timeout_ms: 2_000,
        retry_interval_ms: 5,
    }
}

/// 基于全新内存基座的上下文
pub fn memory_context() -> CacheContext {
    CacheContext::new(Arc::new(MemorySubstrate::new())).with_lock_options(fast_lock())
}

/// 共享同一个基座的两个上下文，模拟两个进程
pub fn twin_contexts() -> (CacheContext, CacheContext) {
    let substrate: Arc<dyn KvSubstrate> = Arc::new(MemorySubstrate::new());
    (
        CacheContext::new(substrate.clone()).with_lock_options(fast_lock()),
        CacheContext::new(substrate).with_lock_options(fast_lock()),
    )
}

pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

pub fn redis_config() -> RedisConfig {
    RedisConfig {
        connection_string: SecretString::new(redis_url().into()),
        connection_timeout_ms: 1000,
        command_timeout_ms: 1000,
        ..Default::default()
    }
}

/// 连接Redis，不可用时返回 `None`
pub async fn connect_redis() -> Option<RedisSubstrate> {
    let substrate = RedisSubstrate::connect(&redis_config()).await.ok()?;
    substrate.ping().await.ok()?;
    Some(substrate)
}

/// 可以随时切换为失败状态的基座，用于验证错误传播
pub struct FlakySubstrate {
    inner: MemorySubstrate,
    failing: AtomicBool,
    drop_writes: AtomicBool,
    vanish_next_increment: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakySubstrate {
    pub fn new() -> Self {
        Self {
            inner: MemorySubstrate::new(),
            failing: AtomicBool::new(false),
            drop_writes: AtomicBool::new(false),
            vanish_next_increment: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 开启后普通写入被静默丢弃
    pub fn set_drop_writes(&self, drop_writes: bool) {
        self.drop_writes.store(drop_writes, Ordering::SeqCst);
    }

    /// 下一次递增之前删除目标键，模拟键恰好在两次操作之间过期
    pub fn set_vanish_next_increment(&self, vanish: bool) {
        self.vanish_next_increment.store(vanish, Ordering::SeqCst);
    }

    async fn maybe_vanish(&self, key: &str) -> Result<()> {
        if self.vanish_next_increment.swap(false, Ordering::SeqCst) {
            self.inner.delete(key).await?;
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Substrate("substrate unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvSubstrate for FlakySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        if self.drop_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check()?;
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check()?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        self.check()?;
        self.maybe_vanish(key).await?;
        self.inner.increment(key, delta, ttl).await
    }

    async fn increment_existing(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        self.check()?;
        self.maybe_vanish(key).await?;
        self.inner.increment_existing(key, delta).await
    }

    async fn push_capped(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.check()?;
        self.inner.push_capped(key, values, capacity, ttl).await
    }

    async fn list_replace(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.check()?;
        self.inner.list_replace(key, values, ttl).await
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        self.inner.list_range(key, start, end).await
    }

    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.check()?;
        self.inner.list_all(key).await
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.check()?;
        self.inner.list_len(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.check()?;
        self.inner.delete_prefix(prefix).await
    }

    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.inner.ping().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
