//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了两级缓存：进程内的 [`LoadingCache`] 在前，共享缓存在后。
//!
//! 前端未命中时由后端加载，写入同时落到两层，前端的失效通过监听器传递到后端。

use super::{check_nullable, CacheOps, CacheValue, Invalidation, InvalidationListener, LoadingCache};
use crate::config::CacheOptions;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// 把前端失效转发到后端的监听器
struct CascadeListener<V> {
    back: Arc<dyn CacheOps<V>>,
}

#[async_trait]
impl<V: CacheValue> InvalidationListener for CascadeListener<V> {
    async fn on_invalidate(&self, cache: &str, event: &Invalidation) -> Result<()> {
        debug!(front = cache, back = self.back.name(), ?event, "cascading invalidation");
        match event {
            Invalidation::Key(key) => self.back.invalidate(key).await,
            Invalidation::All => self.back.invalidate_all().await,
        }
    }
}

/// 两级缓存
pub struct TieredCache<V: CacheValue> {
    front: LoadingCache<V>,
    back: Arc<dyn CacheOps<V>>,
    allow_nulls: bool,
}

impl<V: CacheValue> TieredCache<V> {
    /// 创建两级缓存
    ///
    /// # 参数
    ///
    /// * `name` - 前端缓存名称
    /// * `front_options` - 前端缓存选项（TTL、容量、是否允许空值）
    /// * `back` - 后端缓存，通常是 [`super::DistributedLoadingCache`]
    pub async fn new(
        name: &str,
        front_options: CacheOptions,
        back: Arc<dyn CacheOps<V>>,
    ) -> Result<Self> {
        let allow_nulls = front_options.allow_nulls;
        let source = back.clone();
        let front = LoadingCache::new(name, front_options, move |key: String| {
            let source = source.clone();
            async move { source.get(&key).await.map_err(anyhow::Error::from) }
        })?;
        front
            .add_invalidation_listener(Arc::new(CascadeListener { back: back.clone() }))
            .await;
        Ok(Self {
            front,
            back,
            allow_nulls,
        })
    }

    pub fn front(&self) -> &LoadingCache<V> {
        &self.front
    }

    pub fn back(&self) -> &Arc<dyn CacheOps<V>> {
        &self.back
    }

    /// 读取值：前端命中直接返回，否则由后端加载后回填前端
    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        self.front.get(key).await
    }

    /// 写穿两层
    ///
    /// 前端不接受的空值在写入任何一层之前被拒绝。
    pub async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        check_nullable(self.allow_nulls, key, &value)?;
        self.back.put(key, value.clone()).await?;
        self.front.put(key, value).await
    }

    /// 使两层中的键失效
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.front.invalidate(key).await
    }

    /// 使两层全部失效
    pub async fn invalidate_all(&self) -> Result<()> {
        self.front.invalidate_all().await
    }
}

#[async_trait]
impl<V: CacheValue> CacheOps<V> for TieredCache<V> {
    fn name(&self) -> &str {
        self.front.name()
    }

    async fn get(&self, key: &str) -> Result<Option<V>> {
        TieredCache::get(self, key).await
    }

    async fn put(&self, key: &str, value: Option<V>) -> Result<()> {
        TieredCache::put(self, key, value).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        TieredCache::invalidate(self, key).await
    }

    async fn invalidate_all(&self) -> Result<()> {
        TieredCache::invalidate_all(self).await
    }
}
