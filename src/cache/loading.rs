//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内的加载缓存（cache-aside）。
//!
//! 条目保存在 moka 缓存中，写入后按固定TTL过期；未命中时由 [`KeyScopedMutex`]
//! 保证同一个键的加载器只执行一次。

use super::{
    check_nullable, CacheOps, CacheValue, Invalidation, InvalidationListener, Listeners, Loader,
};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::sync::KeyScopedMutex;
use crate::utils::{validate_key, validate_name};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

const COMPONENT: &str = "loading";

/// 未配置TTL时的默认过期时间
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// 进程内加载缓存
pub struct LoadingCache<V: CacheValue> {
    name: Arc<str>,
    store: Cache<String, Option<V>>,
    loader: Arc<dyn Loader<V>>,
    mutex: KeyScopedMutex<Option<V>>,
    allow_nulls: bool,
    listeners: Listeners,
}

impl<V: CacheValue> Clone for LoadingCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
            loader: self.loader.clone(),
            mutex: self.mutex.clone(),
            allow_nulls: self.allow_nulls,
            listeners: self.listeners.clone(),
        }
    }
}

impl<V: CacheValue> LoadingCache<V> {
    /// 创建新的加载缓存
    ///
    /// # 参数
    ///
    /// * `name` - 缓存名称
    /// * `options` - 缓存选项，`ttl` 未设置时使用 [`DEFAULT_TTL`]
    /// * `loader` - 未命中时调用的加载器
    ///
    /// # 返回值
    ///
    /// 名称非法或 `max_entries` 为0时返回 `Configuration` 错误
    pub fn new(name: &str, options: CacheOptions, loader: impl Loader<V>) -> Result<Self> {
        Self::with_loader(name, options, Arc::new(loader))
    }

    /// 使用共享的加载器创建缓存
    pub fn with_loader(
        name: &str,
        options: CacheOptions,
        loader: Arc<dyn Loader<V>>,
    ) -> Result<Self> {
        validate_name(name)?;
        if options.max_entries == 0 {
            return Err(CacheError::Configuration(format!(
                "cache '{}' max_entries cannot be zero",
                name
            )));
        }
        let ttl = options.ttl_or(DEFAULT_TTL);
        if ttl.is_zero() {
            return Err(CacheError::Configuration(format!(
                "cache '{}' ttl cannot be zero",
                name
            )));
        }

        let store = Cache::builder()
            .max_capacity(options.max_entries)
            .time_to_live(ttl)
            .build();

        info!(cache = name, ttl_ms = ttl.as_millis() as u64, "loading cache created");
        Ok(Self {
            name: Arc::from(name),
            store,
            loader,
            mutex: KeyScopedMutex::new(name),
            allow_nulls: options.allow_nulls,
            listeners: Listeners::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 读取值，未命中时单飞加载
    ///
    /// 所有并发调用者拿到同一次加载的结果；加载失败不会被缓存。
    #[instrument(skip(self), level = "debug", fields(cache = %self.name))]
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        validate_key(key)?;
        if let Some(value) = self.store.get(key).await {
            GLOBAL_METRICS.record_request(&self.name, COMPONENT, "get", "hit");
            return Ok(value);
        }
        GLOBAL_METRICS.record_request(&self.name, COMPONENT, "get", "miss");

        let store = self.store.clone();
        let loader = self.loader.clone();
        let allow_nulls = self.allow_nulls;
        let name = self.name.clone();
        let owned_key = key.to_string();
        self.mutex
            .run_exclusive_once(key, move || async move {
                if let Some(value) = store.get(&owned_key).await {
                    debug!(key = %owned_key, "filled by a previous flight");
                    return Ok(value);
                }
                let started = Instant::now();
                let loaded = loader.load(&owned_key).await;
                GLOBAL_METRICS.record_duration(
                    &name,
                    COMPONENT,
                    "load",
                    started.elapsed().as_secs_f64(),
                );
                let value = loaded.map_err(|e| {
                    GLOBAL_METRICS.record_request(&name, COMPONENT, "load", "error");
                    CacheError::from_loader(&owned_key, e)
                })?;
                check_nullable(allow_nulls, &owned_key, &value)?;
                store.insert(owned_key.clone(), value.clone()).await;
                debug!(key = %owned_key, "loaded");
                Ok(value)
            })
            .await
    }

    /// 只读取进程内已有的值，不触发加载
    ///
    /// # 返回值
    ///
    /// 未命中返回 `None`；命中空值返回 `Some(None)`
    pub async fn get_if_present(&self, key: &str) -> Option<Option<V>> {
        self.store.get(key).await
    }

    /// 直接写入值
    pub async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        validate_key(key)?;
        check_nullable(self.allow_nulls, key, &value)?;
        self.store.insert(key.to_string(), value).await;
        Ok(())
    }

    /// 使单个键失效并通知监听器
    ///
    /// 失效时仍在进行的加载完成后会写入它的结果。
    #[instrument(skip(self), level = "debug", fields(cache = %self.name))]
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.store.invalidate(key).await;
        self.listeners
            .notify(&self.name, &Invalidation::Key(key.to_string()))
            .await
    }

    /// 使全部键失效并通知监听器
    pub async fn invalidate_all(&self) -> Result<()> {
        self.store.invalidate_all();
        self.listeners.notify(&self.name, &Invalidation::All).await
    }

    /// 注册失效监听器
    pub async fn add_invalidation_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners.add(listener).await;
    }
}

#[async_trait]
impl<V: CacheValue> CacheOps<V> for LoadingCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        LoadingCache::get(self, key).await
    }

    async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        LoadingCache::put(self, key, value).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        LoadingCache::invalidate(self, key).await
    }

    async fn invalidate_all(&self) -> Result<()> {
        LoadingCache::invalidate_all(self).await
    }
}
