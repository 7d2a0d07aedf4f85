//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于KV基座的共享加载缓存。
//!
//! 条目存放在基座中，集群内所有进程共享。未命中时先在进程内单飞，再获取按键的租约锁，
//! 拿到锁后再检查一次（其它进程可能已经加载完成），仍未命中才调用加载器。
//! 获取锁超时直接报错，不会退化为无协调的加载。

use super::{
    check_nullable, CacheContext, CacheEntry, CacheOps, CacheValue, Invalidation,
    InvalidationListener, KeySpace, Listeners, Loader,
};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::serialization::{Serializer, SerializerEnum};
use crate::substrate::KvSubstrate;
use crate::sync::{KeyScopedMutex, LeaseLock};
use crate::utils::{validate_key, validate_name};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const COMPONENT: &str = "distributed";

struct Inner<V: CacheValue> {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    lock: LeaseLock,
    loader: Arc<dyn Loader<V>>,
    serializer: SerializerEnum,
    allow_nulls: bool,
    ttl: Duration,
    listeners: Listeners,
}

/// 共享加载缓存
pub struct DistributedLoadingCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
    mutex: KeyScopedMutex<Option<V>>,
}

impl<V: CacheValue> Clone for DistributedLoadingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mutex: self.mutex.clone(),
        }
    }
}

impl<V: CacheValue> Inner<V> {
    async fn read(&self, key: &str) -> Result<Option<Option<V>>> {
        match self.substrate.get(&self.keys.key("entry", key)).await? {
            Some(bytes) => {
                let entry: CacheEntry<V> = self.serializer.deserialize(&bytes)?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: Option<V>) -> Result<()> {
        let entry = CacheEntry::new(key, value);
        let bytes = self.serializer.serialize(&entry)?;
        self.substrate
            .set(&self.keys.key("entry", key), bytes, Some(self.ttl))
            .await
    }

    /// 在租约锁保护下完成双重检查与加载
    async fn load_coordinated(&self, key: &str) -> Result<Option<V>> {
        let guard = self.lock.acquire(&self.keys.key("lock", key)).await?;

        let outcome = async {
            if let Some(value) = self.read(key).await? {
                debug!(cache = %self.name, key, "filled by another process");
                GLOBAL_METRICS.record_request(&self.name, COMPONENT, "load", "skipped");
                return Ok(value);
            }
            let started = Instant::now();
            let loaded = self.loader.load(key).await;
            GLOBAL_METRICS.record_duration(
                &self.name,
                COMPONENT,
                "load",
                started.elapsed().as_secs_f64(),
            );
            let value = loaded.map_err(|e| {
                GLOBAL_METRICS.record_request(&self.name, COMPONENT, "load", "error");
                CacheError::from_loader(key, e)
            })?;
            check_nullable(self.allow_nulls, key, &value)?;
            self.write(key, value.clone()).await?;
            info!(cache = %self.name, key, "loaded into substrate");
            Ok(value)
        }
        .await;

        if let Err(e) = guard.release().await {
            warn!(cache = %self.name, key, error = %e, "failed to release load lock");
        }
        outcome
    }
}

impl<V: CacheValue> DistributedLoadingCache<V> {
    /// 创建新的共享加载缓存
    ///
    /// # 参数
    ///
    /// * `context` - 基座与锁参数
    /// * `name` - 缓存名称，同名缓存在集群内共享条目
    /// * `options` - 缓存选项，`ttl` 未设置时使用 [`super::loading::DEFAULT_TTL`]
    /// * `loader` - 未命中时调用的加载器
    pub fn new(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        loader: impl Loader<V>,
    ) -> Result<Self> {
        Self::with_loader(context, name, options, Arc::new(loader))
    }

    /// 使用共享的加载器创建缓存
    pub fn with_loader(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        loader: Arc<dyn Loader<V>>,
    ) -> Result<Self> {
        validate_name(name)?;
        let ttl = options.ttl_or(super::loading::DEFAULT_TTL);
        if ttl.is_zero() {
            return Err(CacheError::Configuration(format!(
                "cache '{}' ttl cannot be zero",
                name
            )));
        }
        info!(cache = name, substrate = context.substrate.name(), "distributed cache created");
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                keys: context.key_space(name),
                substrate: context.substrate.clone(),
                lock: context.lease_lock(),
                loader,
                serializer: options.serializer,
                allow_nulls: options.allow_nulls,
                ttl,
                listeners: Listeners::default(),
            }),
            mutex: KeyScopedMutex::new(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 读取值，未命中时在集群范围内只加载一次
    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        validate_key(key)?;
        if let Some(value) = self.inner.read(key).await? {
            GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "hit");
            return Ok(value);
        }
        GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "miss");

        let inner = self.inner.clone();
        let owned_key = key.to_string();
        self.mutex
            .run_exclusive_once(key, move || async move {
                inner.load_coordinated(&owned_key).await
            })
            .await
    }

    /// 只读取基座中已有的值，不触发加载
    pub async fn get_if_present(&self, key: &str) -> Result<Option<Option<V>>> {
        validate_key(key)?;
        self.inner.read(key).await
    }

    /// 直接写入值
    pub async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        validate_key(key)?;
        check_nullable(self.inner.allow_nulls, key, &value)?;
        self.inner.write(key, value).await
    }

    /// 使单个键失效并通知监听器
    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.inner
            .substrate
            .delete(&self.inner.keys.key("entry", key))
            .await?;
        self.inner
            .listeners
            .notify(&self.inner.name, &Invalidation::Key(key.to_string()))
            .await
    }

    /// 删除本缓存在基座中的全部条目
    pub async fn invalidate_all(&self) -> Result<()> {
        let removed = self
            .inner
            .substrate
            .delete_prefix(&self.inner.keys.part_prefix("entry"))
            .await?;
        info!(cache = %self.inner.name, removed, "invalidated all entries");
        self.inner
            .listeners
            .notify(&self.inner.name, &Invalidation::All)
            .await
    }

    /// 注册失效监听器
    pub async fn add_invalidation_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.inner.listeners.add(listener).await;
    }
}

#[async_trait]
impl<V: CacheValue> CacheOps<V> for DistributedLoadingCache<V> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        DistributedLoadingCache::get(self, key).await
    }

    async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        DistributedLoadingCache::put(self, key, value).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        DistributedLoadingCache::invalidate(self, key).await
    }

    async fn invalidate_all(&self) -> Result<()> {
        DistributedLoadingCache::invalidate_all(self).await
    }
}
