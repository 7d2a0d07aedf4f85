//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了逻辑/物理双TTL的预刷新缓存（stale-while-revalidate）。
//!
//! 每个键的状态：
//!
//! * 新鲜（年龄 < 逻辑TTL）：直接返回。
//! * 陈旧（逻辑TTL ≤ 年龄 < 物理TTL）：立即返回旧值，同时在后台调度至多一次刷新；
//!   刷新先尝试获取租约锁，其它进程正在刷新时直接放弃。
//! * 缺失（年龄 ≥ 物理TTL 或从未加载）：阻塞调用者，在单飞与租约锁保护下加载，
//!   然后重新读取；重读次数受 `max_retries` 约束，耗尽返回 `CoordinationTimeout`。

use super::{check_nullable, CacheContext, CacheEntry, CacheValue, KeySpace, Loader};
use crate::config::{CacheOptions, RefreshAheadOptions};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::serialization::{Serializer, SerializerEnum};
use crate::substrate::KvSubstrate;
use crate::sync::{KeyScopedMutex, LeaseLock};
use crate::utils::{validate_key, validate_name};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const COMPONENT: &str = "refresh_ahead";

struct Inner<V: CacheValue> {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    lock: LeaseLock,
    loader: Arc<dyn Loader<V>>,
    serializer: SerializerEnum,
    allow_nulls: bool,
    logical_ttl: Duration,
    physical_ttl: Duration,
}

impl<V: CacheValue> Inner<V> {
    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        match self.substrate.get(&self.keys.key("entry", key)).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_entry(&self, key: &str, value: Option<V>) -> Result<()> {
        let entry = CacheEntry::new(key, value);
        let bytes = self.serializer.serialize(&entry)?;
        self.substrate
            .set(&self.keys.key("entry", key), bytes, Some(self.physical_ttl))
            .await
    }

    async fn load_and_store(&self, key: &str) -> Result<()> {
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
        self.write_entry(key, value).await
    }

    /// 缺失路径：阻塞获取租约锁，双重检查后加载
    async fn fill(&self, key: &str) -> Result<()> {
        let guard = self.lock.acquire(&self.keys.key("lock", key)).await?;
        let outcome = async {
            if let Some(entry) = self.read_entry(key).await? {
                if entry.age() < self.physical_ttl {
                    debug!(cache = %self.name, key, "filled by another process");
                    return Ok(());
                }
            }
            self.load_and_store(key).await?;
            info!(cache = %self.name, key, "loaded");
            Ok(())
        }
        .await;
        if let Err(e) = guard.release().await {
            warn!(cache = %self.name, key, error = %e, "failed to release load lock");
        }
        outcome
    }

    /// 陈旧路径的后台刷新：锁已被其它进程持有时不做任何事
    async fn refresh(&self, key: &str) -> Result<()> {
        let Some(guard) = self.lock.try_acquire(&self.keys.key("lock", key)).await? else {
            debug!(cache = %self.name, key, "refresh already in progress elsewhere");
            return Ok(());
        };
        let outcome = async {
            if let Some(entry) = self.read_entry(key).await? {
                if entry.age() < self.logical_ttl {
                    debug!(cache = %self.name, key, "already refreshed");
                    return Ok(());
                }
            }
            self.load_and_store(key).await?;
            GLOBAL_METRICS.record_request(&self.name, COMPONENT, "refresh", "success");
            info!(cache = %self.name, key, "refreshed in background");
            Ok(())
        }
        .await;
        if let Err(e) = guard.release().await {
            warn!(cache = %self.name, key, error = %e, "failed to release refresh lock");
        }
        if outcome.is_err() {
            GLOBAL_METRICS.record_request(&self.name, COMPONENT, "refresh", "error");
        }
        outcome
    }
}

/// 预刷新缓存
pub struct RefreshAheadCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
    mutex: KeyScopedMutex<()>,
    max_retries: u32,
}

impl<V: CacheValue> Clone for RefreshAheadCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mutex: self.mutex.clone(),
            max_retries: self.max_retries,
        }
    }
}

impl<V: CacheValue> RefreshAheadCache<V> {
    /// 创建预刷新缓存
    ///
    /// # 参数
    ///
    /// * `context` - 基座与锁参数
    /// * `name` - 缓存名称
    /// * `options` - 缓存选项（`ttl` 不使用，条目按物理TTL写入）
    /// * `refresh` - 逻辑/物理TTL与重试次数
    /// * `loader` - 加载器
    ///
    /// # 返回值
    ///
    /// 不满足 `physical_ttl > logical_ttl > 0` 时返回 `Configuration` 错误
    pub fn new(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        refresh: RefreshAheadOptions,
        loader: impl Loader<V>,
    ) -> Result<Self> {
        Self::with_loader(context, name, options, refresh, Arc::new(loader))
    }

    /// 使用共享的加载器创建缓存
    pub fn with_loader(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        refresh: RefreshAheadOptions,
        loader: Arc<dyn Loader<V>>,
    ) -> Result<Self> {
        validate_name(name)?;
        refresh.validate()?;
        info!(
            cache = name,
            logical_ttl_ms = refresh.logical_ttl_ms,
            physical_ttl_ms = refresh.physical_ttl_ms,
            "refresh-ahead cache created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                keys: context.key_space(name),
                substrate: context.substrate.clone(),
                lock: context.lease_lock(),
                loader,
                serializer: options.serializer,
                allow_nulls: options.allow_nulls,
                logical_ttl: refresh.logical_ttl(),
                physical_ttl: refresh.physical_ttl(),
            }),
            mutex: KeyScopedMutex::new(name),
            max_retries: refresh.max_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 读取值
    ///
    /// 陈旧条目立即返回旧值并触发后台刷新；缺失条目阻塞加载。
    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        validate_key(key)?;
        for attempt in 1..=self.max_retries {
            if let Some(entry) = self.inner.read_entry(key).await? {
                let age = entry.age();
                if age < self.inner.logical_ttl {
                    GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "fresh");
                    return Ok(entry.value);
                }
                if age < self.inner.physical_ttl {
                    GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "stale");
                    self.schedule_refresh(key);
                    return Ok(entry.value);
                }
            }

            GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "miss");
            debug!(key, attempt, "entry absent, loading");
            let inner = self.inner.clone();
            let owned_key = key.to_string();
            self.mutex
                .run_exclusive_once(key, move || async move { inner.fill(&owned_key).await })
                .await?;
        }

        GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "get", "exhausted");
        Err(CacheError::CoordinationTimeout(format!(
            "reached max get retries ({}) for key '{}'",
            self.max_retries, key
        )))
    }

    /// 为键调度后台刷新
    ///
    /// # 返回值
    ///
    /// 本次调用确实调度了刷新返回 `true`
    pub fn schedule_refresh(&self, key: &str) -> bool {
        let inner = self.inner.clone();
        let owned_key = key.to_string();
        self.mutex
            .run_at_most_one_concurrent(key, move || async move { inner.refresh(&owned_key).await })
    }

    /// 直接写入新鲜值
    pub async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        validate_key(key)?;
        check_nullable(self.inner.allow_nulls, key, &value)?;
        self.inner.write_entry(key, value).await
    }

    /// 读取条目（包含加载时间），不触发加载或刷新
    pub async fn peek(&self, key: &str) -> Result<Option<CacheEntry<V>>> {
        validate_key(key)?;
        self.inner.read_entry(key).await
    }

    /// 使单个键失效
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.inner
            .substrate
            .delete(&self.inner.keys.key("entry", key))
            .await?;
        Ok(())
    }

    /// 使全部键失效
    pub async fn invalidate_all(&self) -> Result<()> {
        self.inner
            .substrate
            .delete_prefix(&self.inner.keys.part_prefix("entry"))
            .await?;
        Ok(())
    }

    /// 后台刷新是否仍在进行
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.mutex.is_running_in_background(key)
    }
}
