//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了原子计数器缓存。
//!
//! 计数器缺失时由加载器提供初值，初始化用"不存在才写入"完成，并发初始化者不会互相覆盖；
//! 之后只通过基座对已存在计数器的原子递增修改。

use super::{parse_integer, CacheContext, CounterLoader, KeySpace};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::substrate::KvSubstrate;
use crate::sync::KeyScopedMutex;
use crate::utils::{validate_key, validate_name};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const COMPONENT: &str = "counter";
const MAX_INIT_ATTEMPTS: usize = 3;

struct Inner {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    loader: Arc<dyn CounterLoader>,
    ttl: Option<Duration>,
}

impl Inner {
    async fn read(&self, key: &str) -> Result<Option<i64>> {
        match self.substrate.get(&self.keys.key("counter", key)).await? {
            Some(bytes) => parse_integer("counter", key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn initialize(&self, key: &str) -> Result<i64> {
        if let Some(value) = self.read(key).await? {
            return Ok(value);
        }
        let initial = self
            .loader
            .initial_value(key)
            .await
            .map_err(|e| CacheError::from_loader(key, e))?;
        let won = self
            .substrate
            .set_if_absent(
                &self.keys.key("counter", key),
                initial.to_string().into_bytes(),
                self.ttl,
            )
            .await?;
        if won {
            debug!(cache = %self.name, key, initial, "counter initialized");
            return Ok(initial);
        }
        match self.read(key).await? {
            Some(value) => Ok(value),
            None => Err(CacheError::CoordinationTimeout(format!(
                "counter '{}' vanished during initialization",
                key
            ))),
        }
    }
}

/// 原子计数器缓存
#[derive(Clone)]
pub struct AtomicCounterCache {
    inner: Arc<Inner>,
    mutex: KeyScopedMutex<i64>,
}

impl AtomicCounterCache {
    /// 创建计数器缓存
    ///
    /// `options.ttl` 为计数器首次创建时设置的过期时间，`None` 表示不过期。
    pub fn new(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        loader: impl CounterLoader,
    ) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                keys: context.key_space(name),
                substrate: context.substrate.clone(),
                loader: Arc::new(loader),
                ttl: options.ttl,
            }),
            mutex: KeyScopedMutex::new(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 读取计数器，缺失时初始化
    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    pub async fn get(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        if let Some(value) = self.inner.read(key).await? {
            GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "hit");
            return Ok(value);
        }
        GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "miss");
        let inner = self.inner.clone();
        let owned_key = key.to_string();
        self.mutex
            .run_exclusive_once(key, move || async move { inner.initialize(&owned_key).await })
            .await
    }

    /// 原子地加上 `delta` 并返回新值
    ///
    /// 递增只作用于已存在的计数器。计数器在初始化与递增之间过期时重新初始化，
    /// 不会从 `delta` 起算。
    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    pub async fn add_and_get(&self, key: &str, delta: i64) -> Result<i64> {
        validate_key(key)?;
        let counter_key = self.inner.keys.key("counter", key);
        for _ in 0..MAX_INIT_ATTEMPTS {
            if let Some(value) = self
                .inner
                .substrate
                .increment_existing(&counter_key, delta)
                .await?
            {
                return Ok(value);
            }
            debug!(key, "counter missing before increment");
            self.get(key).await?;
        }
        Err(CacheError::CoordinationTimeout(format!(
            "counter '{}' kept vanishing before increment",
            key
        )))
    }

    /// 直接设置计数器的值
    pub async fn set(&self, key: &str, value: i64) -> Result<()> {
        validate_key(key)?;
        self.inner
            .substrate
            .set(
                &self.inner.keys.key("counter", key),
                value.to_string().into_bytes(),
                self.inner.ttl,
            )
            .await
    }

    /// 删除计数器，下次读取时重新初始化
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.inner
            .substrate
            .delete(&self.inner.keys.key("counter", key))
            .await?;
        Ok(())
    }
}
