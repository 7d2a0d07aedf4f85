//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器，负责按配置搭建基座并创建命名缓存。
//!
//! 协调器是显式持有的实例而不是全局单例，同一进程中的多个协调器互不干扰。

use crate::cache::{
    AtomicCounterCache, BatchLoader, BoundedCollectionCache, CacheContext, CacheValue,
    ConsumableListCache, ConsumableMapCache, CounterLoader, DistributedLoadingCache, Loader,
    LoadingCache, MapLoader, RefreshAheadCache, TieredCache,
};
use crate::config::{CacheConfig, CacheKind, Config, SubstrateMode};
use crate::error::{CacheError, Result};
use crate::substrate::{KvSubstrate, MemorySubstrate, RedisSubstrate};
use std::sync::Arc;
use tracing::{info, instrument};

/// 协调器
pub struct Coordinator {
    config: Config,
    context: CacheContext,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("context", &self.context)
            .field("caches", &self.cache_names())
            .finish()
    }
}

impl Coordinator {
    /// 按配置连接基座并创建协调器
    ///
    /// # 参数
    ///
    /// * `config` - 引擎配置，会先经过验证
    ///
    /// # 返回值
    ///
    /// 返回协调器实例，配置非法或基座无法连接时返回错误
    #[instrument(skip(config), level = "info", fields(cache_count = config.caches.len()))]
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let substrate: Arc<dyn KvSubstrate> = match config.substrate.mode {
            SubstrateMode::Memory => Arc::new(MemorySubstrate::new()),
            SubstrateMode::Redis => {
                let redis = config.substrate.redis.as_ref().ok_or_else(|| {
                    CacheError::Configuration("missing [substrate.redis] section".to_string())
                })?;
                Arc::new(RedisSubstrate::connect(redis).await?)
            }
        };
        Self::with_substrate(config, substrate)
    }

    /// 使用已有的基座创建协调器
    ///
    /// 测试中可以让多个协调器共享同一个 [`MemorySubstrate`] 来模拟多个进程。
    pub fn with_substrate(config: Config, substrate: Arc<dyn KvSubstrate>) -> Result<Self> {
        config.validate()?;
        let context = CacheContext::new(substrate)
            .with_namespace(config.global.namespace.clone())
            .with_lock_options(config.global.lock.clone());
        info!(
            namespace = %config.global.namespace,
            substrate = context.substrate.name(),
            caches = config.caches.len(),
            "coordinator initialized"
        );
        Ok(Self { config, context })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    pub fn substrate(&self) -> &Arc<dyn KvSubstrate> {
        &self.context.substrate
    }

    /// 已配置的缓存名称（按字母排序）
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// 检查基座是否可用
    pub async fn ping(&self) -> Result<()> {
        self.context.substrate.ping().await
    }

    fn cache_config(&self, name: &str, kind: CacheKind) -> Result<&CacheConfig> {
        let cache = self.config.cache(name).ok_or_else(|| {
            CacheError::Configuration(format!("cache '{}' is not configured", name))
        })?;
        if cache.kind != kind {
            return Err(CacheError::Configuration(format!(
                "cache '{}' is configured as {:?}, not {:?}",
                name, cache.kind, kind
            )));
        }
        Ok(cache)
    }

    /// 创建进程内加载缓存
    pub fn loading_cache<V: CacheValue>(
        &self,
        name: &str,
        loader: impl Loader<V>,
    ) -> Result<LoadingCache<V>> {
        let cache = self.cache_config(name, CacheKind::Loading)?;
        LoadingCache::new(name, cache.options(&self.config.global), loader)
    }

    /// 创建共享加载缓存
    pub fn distributed_cache<V: CacheValue>(
        &self,
        name: &str,
        loader: impl Loader<V>,
    ) -> Result<DistributedLoadingCache<V>> {
        let cache = self.cache_config(name, CacheKind::Distributed)?;
        DistributedLoadingCache::new(
            &self.context,
            name,
            cache.options(&self.config.global),
            loader,
        )
    }

    /// 创建两级缓存，前后两层使用同一组选项
    pub async fn tiered_cache<V: CacheValue>(
        &self,
        name: &str,
        loader: impl Loader<V>,
    ) -> Result<TieredCache<V>> {
        let cache = self.cache_config(name, CacheKind::Tiered)?;
        let options = cache.options(&self.config.global);
        let back = DistributedLoadingCache::new(&self.context, name, options.clone(), loader)?;
        TieredCache::new(name, options, Arc::new(back)).await
    }

    /// 创建预刷新缓存
    pub fn refresh_ahead_cache<V: CacheValue>(
        &self,
        name: &str,
        loader: impl Loader<V>,
    ) -> Result<RefreshAheadCache<V>> {
        let cache = self.cache_config(name, CacheKind::RefreshAhead)?;
        let refresh = cache.refresh.clone().ok_or_else(|| {
            CacheError::Configuration(format!("cache '{}' has no [refresh] section", name))
        })?;
        RefreshAheadCache::new(
            &self.context,
            name,
            cache.options(&self.config.global),
            refresh,
            loader,
        )
    }

    /// 创建可消费列表缓存
    pub fn consumable_list<V: CacheValue>(
        &self,
        name: &str,
        loader: impl BatchLoader<V>,
    ) -> Result<ConsumableListCache<V>> {
        let cache = self.cache_config(name, CacheKind::ConsumableList)?;
        ConsumableListCache::new(
            &self.context,
            name,
            cache.options(&self.config.global),
            cache.partition.clone().unwrap_or_default(),
            loader,
        )
    }

    /// 创建可消费映射缓存
    pub fn consumable_map<V: CacheValue>(
        &self,
        name: &str,
        loader: impl MapLoader<V>,
    ) -> Result<ConsumableMapCache<V>> {
        let cache = self.cache_config(name, CacheKind::ConsumableMap)?;
        ConsumableMapCache::new(
            &self.context,
            name,
            cache.options(&self.config.global),
            cache.partition.clone().unwrap_or_default(),
            loader,
        )
    }

    /// 创建定长集合缓存
    pub fn bounded_collection<V: CacheValue>(
        &self,
        name: &str,
    ) -> Result<BoundedCollectionCache<V>> {
        let cache = self.cache_config(name, CacheKind::Bounded)?;
        BoundedCollectionCache::new(&self.context, name, cache.options(&self.config.global))
    }

    /// 创建原子计数器缓存
    pub fn counter(&self, name: &str, loader: impl CounterLoader) -> Result<AtomicCounterCache> {
        let cache = self.cache_config(name, CacheKind::Counter)?;
        AtomicCounterCache::new(
            &self.context,
            name,
            cache.options(&self.config.global),
            loader,
        )
    }
}
