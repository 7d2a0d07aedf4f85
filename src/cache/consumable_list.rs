//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了可消费列表缓存。
//!
//! 每个键的批次只加载一次，存成一个不可变的分区：分区头记录代号 `generation` 与元素数量，
//! 元素按代号单独存成基座列表。消费进度是基座中按代号区分的计数器，只通过原子递增前进。
//! 每次 `take` 递增 `count` 并只读取 `[end - count, end)` 区间，任意并发下区间都不重叠。
//! 空批次同样写入分区头，不会与"尚未加载"混淆。

use super::{parse_integer, BatchLoader, CacheContext, CacheValue, KeySpace};
use crate::config::{CacheOptions, PartitionOptions};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::serialization::{Serializer, SerializerEnum};
use crate::substrate::KvSubstrate;
use crate::sync::{KeyScopedMutex, LeaseLock};
use crate::utils::{validate_key, validate_name};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const COMPONENT: &str = "consumable_list";

/// 元素列表比分区头多保留的时间上限，分区头可见期间元素一定可读
const ITEMS_GRACE: Duration = Duration::from_secs(5);

/// 存储在基座中的分区头
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPartition {
    pub generation: String,
    pub loaded_at: DateTime<Utc>,
    pub len: usize,
}

struct Inner<V: CacheValue> {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    lock: LeaseLock,
    loader: Arc<dyn BatchLoader<V>>,
    serializer: SerializerEnum,
    ttl: Duration,
}

impl<V: CacheValue> Inner<V> {
    fn cursor_key(&self, key: &str, generation: &str) -> String {
        self.keys.key("cursor", &format!("{}:{}", key, generation))
    }

    fn items_key(&self, key: &str, generation: &str) -> String {
        self.keys.key("items", &format!("{}:{}", key, generation))
    }

    async fn read(&self, key: &str) -> Result<Option<StoredPartition>> {
        match self.substrate.get(&self.keys.key("list", key)).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 读取分区中 `[start, end)` 区间的元素
    async fn slice(
        &self,
        key: &str,
        partition: &StoredPartition,
        start: usize,
        end: usize,
    ) -> Result<Vec<V>> {
        let encoded = self
            .substrate
            .list_range(&self.items_key(key, &partition.generation), start, end)
            .await?;
        if encoded.len() != end - start {
            return Err(CacheError::Substrate(format!(
                "items of '{}' generation {} are missing",
                key, partition.generation
            )));
        }
        encoded
            .iter()
            .map(|bytes| self.serializer.deserialize(bytes))
            .collect()
    }

    /// 在租约锁（容量为1的加载信号量）保护下加载批次
    ///
    /// `stale` 为 `None` 表示冷加载，已有分区即可直接使用；
    /// 为 `Some(generation)` 表示替换已耗尽的那一代，其它调用者已替换过时直接使用新分区。
    async fn load(&self, key: &str, stale: Option<String>) -> Result<Arc<StoredPartition>> {
        let guard = self.lock.acquire(&self.keys.key("lock", key)).await?;
        let outcome = async {
            if let Some(current) = self.read(key).await? {
                let reusable = match &stale {
                    None => true,
                    Some(generation) => &current.generation != generation,
                };
                if reusable {
                    debug!(cache = %self.name, key, generation = %current.generation, "partition already loaded");
                    return Ok(Arc::new(current));
                }
            }

            let started = Instant::now();
            let loaded = self.loader.load_batch(key).await;
            GLOBAL_METRICS.record_duration(
                &self.name,
                COMPONENT,
                "load",
                started.elapsed().as_secs_f64(),
            );
            let items = loaded.map_err(|e| {
                GLOBAL_METRICS.record_request(&self.name, COMPONENT, "load", "error");
                CacheError::from_loader(key, e)
            })?;
            let partition = StoredPartition {
                generation: uuid::Uuid::new_v4().simple().to_string(),
                loaded_at: Utc::now(),
                len: items.len(),
            };
            let encoded = items
                .iter()
                .map(|item| self.serializer.serialize(item))
                .collect::<Result<Vec<_>>>()?;
            // 元素先于分区头写入
            self.substrate
                .list_replace(
                    &self.items_key(key, &partition.generation),
                    encoded,
                    Some(self.ttl + self.ttl.min(ITEMS_GRACE)),
                )
                .await?;
            let bytes = self.serializer.serialize(&partition)?;
            self.substrate
                .set(&self.keys.key("list", key), bytes, Some(self.ttl))
                .await?;
            info!(
                cache = %self.name,
                key,
                generation = %partition.generation,
                items = partition.len,
                "partition loaded"
            );
            Ok(Arc::new(partition))
        }
        .await;
        if let Err(e) = guard.release().await {
            warn!(cache = %self.name, key, error = %e, "failed to release load lock");
        }
        outcome
    }
}

/// 可消费列表缓存
pub struct ConsumableListCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
    mutex: KeyScopedMutex<Arc<StoredPartition>>,
    max_reloads: u32,
}

impl<V: CacheValue> Clone for ConsumableListCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mutex: self.mutex.clone(),
            max_reloads: self.max_reloads,
        }
    }
}

impl<V: CacheValue> ConsumableListCache<V> {
    /// 创建可消费列表缓存
    ///
    /// # 参数
    ///
    /// * `context` - 基座与锁参数
    /// * `name` - 缓存名称
    /// * `options` - 缓存选项，`ttl` 决定分区多久后过期并从头重新加载
    /// * `partition` - 自动重载次数
    /// * `loader` - 批次加载器
    pub fn new(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        partition: PartitionOptions,
        loader: impl BatchLoader<V>,
    ) -> Result<Self> {
        validate_name(name)?;
        let ttl = options.ttl_or(super::loading::DEFAULT_TTL);
        if ttl.is_zero() {
            return Err(CacheError::Configuration(format!(
                "cache '{}' ttl cannot be zero",
                name
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                keys: context.key_space(name),
                substrate: context.substrate.clone(),
                lock: context.lease_lock(),
                loader: Arc::new(loader),
                serializer: options.serializer,
                ttl,
            }),
            mutex: KeyScopedMutex::new(name),
            max_reloads: partition.max_reloads,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    async fn ensure_loaded(
        &self,
        key: &str,
        stale: Option<String>,
    ) -> Result<Arc<StoredPartition>> {
        let inner = self.inner.clone();
        let owned_key = key.to_string();
        self.mutex
            .run_exclusive_once(key, move || async move { inner.load(&owned_key, stale).await })
            .await
    }

    async fn partition(&self, key: &str) -> Result<Arc<StoredPartition>> {
        match self.inner.read(key).await? {
            Some(partition) => Ok(Arc::new(partition)),
            None => self.ensure_loaded(key, None).await,
        }
    }

    /// 领取最多 `count` 个尚未被领取的元素
    ///
    /// 批次耗尽后返回空列表。
    pub async fn take(&self, key: &str, count: usize) -> Result<Vec<V>> {
        self.take_with_reloads(key, count, 0).await
    }

    /// 领取元素，批次耗尽时自动重新加载一次（次数受 `max_reloads` 约束）后重试
    ///
    /// 重载出的批次本身为空时返回空列表；重载预算用完仍被其它消费者抢空时返回
    /// `CoordinationTimeout`。
    pub async fn take_or_reload(&self, key: &str, count: usize) -> Result<Vec<V>> {
        self.take_with_reloads(key, count, self.max_reloads).await
    }

    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.name))]
    async fn take_with_reloads(&self, key: &str, count: usize, max_reloads: u32) -> Result<Vec<V>> {
        validate_key(key)?;
        if count == 0 {
            return Err(CacheError::InvalidArgument(
                "take count must be positive".to_string(),
            ));
        }
        let step = i64::try_from(count)
            .map_err(|_| CacheError::InvalidArgument(format!("take count {} too large", count)))?;

        let mut partition = self.partition(key).await?;
        let mut reloads = 0;
        loop {
            let end = self
                .inner
                .substrate
                .increment(
                    &self.inner.cursor_key(key, &partition.generation),
                    step,
                    Some(self.inner.ttl),
                )
                .await?;
            let end = usize::try_from(end).map_err(|_| {
                CacheError::Substrate(format!("cursor of '{}' is negative: {}", key, end))
            })?;
            let start = end.saturating_sub(count);
            let len = partition.len;

            if start < len {
                let end = end.min(len);
                let items = self.inner.slice(key, &partition, start, end).await?;
                GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "take", "hit");
                debug!(key, start, end, "slice taken");
                return Ok(items);
            }

            GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "take", "exhausted");
            if reloads >= max_reloads {
                if max_reloads > 0 && len > 0 {
                    return Err(CacheError::CoordinationTimeout(format!(
                        "list '{}' exhausted after {} reloads",
                        key, reloads
                    )));
                }
                return Ok(Vec::new());
            }
            reloads += 1;
            debug!(key, generation = %partition.generation, "partition exhausted, reloading");
            partition = self
                .ensure_loaded(key, Some(partition.generation.clone()))
                .await?;
        }
    }

    /// 尚未被领取的元素数量，不触发加载
    ///
    /// 消费进度无法解析时返回 `Serialization` 错误。
    pub async fn remaining(&self, key: &str) -> Result<usize> {
        validate_key(key)?;
        let Some(partition) = self.inner.read(key).await? else {
            return Ok(0);
        };
        let cursor = match self
            .inner
            .substrate
            .get(&self.inner.cursor_key(key, &partition.generation))
            .await?
        {
            Some(bytes) => parse_integer("cursor", key, &bytes)?,
            None => 0,
        };
        let consumed = usize::try_from(cursor).map_err(|_| {
            CacheError::Serialization(format!("cursor of '{}' is negative: {}", key, cursor))
        })?;
        Ok(partition.len.saturating_sub(consumed))
    }

    /// 强制重新加载批次，返回新批次的元素数量
    pub async fn reload(&self, key: &str) -> Result<usize> {
        validate_key(key)?;
        let stale = self
            .inner
            .read(key)
            .await?
            .map(|p| p.generation)
            .unwrap_or_default();
        let partition = self.ensure_loaded(key, Some(stale)).await?;
        Ok(partition.len)
    }

    /// 删除批次及其消费进度
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        if let Some(partition) = self.inner.read(key).await? {
            self.inner
                .substrate
                .delete(&self.inner.cursor_key(key, &partition.generation))
                .await?;
            self.inner
                .substrate
                .delete(&self.inner.items_key(key, &partition.generation))
                .await?;
        }
        self.inner
            .substrate
            .delete(&self.inner.keys.key("list", key))
            .await?;
        Ok(())
    }
}
