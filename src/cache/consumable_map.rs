//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了可消费映射缓存。
//!
//! 批次以不可变映射的形式只加载一次，已被检出的条目记录在按代号区分的"已消费集合"中，
//! 该集合只通过比较并交换修改。检出要么全部成功，要么什么都不改变。

use super::{CacheContext, CacheValue, KeySpace, MapLoader};
use crate::config::{CacheOptions, PartitionOptions};
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::serialization::{Serializer, SerializerEnum};
use crate::substrate::KvSubstrate;
use crate::sync::{KeyScopedMutex, LeaseLock};
use crate::utils::{validate_key, validate_name};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const COMPONENT: &str = "consumable_map";

/// 存储在基座中的映射批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMap<V> {
    pub generation: String,
    pub loaded_at: DateTime<Utc>,
    pub entries: BTreeMap<String, V>,
}

struct Inner<V: CacheValue> {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    lock: LeaseLock,
    loader: Arc<dyn MapLoader<V>>,
    serializer: SerializerEnum,
    ttl: Duration,
}

impl<V: CacheValue> Inner<V> {
    fn consumed_key(&self, map_key: &str, generation: &str) -> String {
        self.keys
            .key("consumed", &format!("{}:{}", map_key, generation))
    }

    async fn read(&self, map_key: &str) -> Result<Option<StoredMap<V>>> {
        match self.substrate.get(&self.keys.key("map", map_key)).await? {
            Some(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load(&self, map_key: &str) -> Result<Arc<StoredMap<V>>> {
        let guard = self.lock.acquire(&self.keys.key("lock", map_key)).await?;
        let outcome = async {
            if let Some(current) = self.read(map_key).await? {
                debug!(cache = %self.name, map_key, "map already loaded");
                return Ok(Arc::new(current));
            }
            let started = Instant::now();
            let loaded = self.loader.load_map(map_key).await;
            GLOBAL_METRICS.record_duration(
                &self.name,
                COMPONENT,
                "load",
                started.elapsed().as_secs_f64(),
            );
            let entries = loaded.map_err(|e| {
                GLOBAL_METRICS.record_request(&self.name, COMPONENT, "load", "error");
                CacheError::from_loader(map_key, e)
            })?;
            let stored = StoredMap {
                generation: uuid::Uuid::new_v4().simple().to_string(),
                loaded_at: Utc::now(),
                entries,
            };
            let bytes = self.serializer.serialize(&stored)?;
            self.substrate
                .set(&self.keys.key("map", map_key), bytes, Some(self.ttl))
                .await?;
            info!(cache = %self.name, map_key, entries = stored.entries.len(), "map loaded");
            Ok(Arc::new(stored))
        }
        .await;
        if let Err(e) = guard.release().await {
            warn!(cache = %self.name, map_key, error = %e, "failed to release load lock");
        }
        outcome
    }

    async fn read_consumed(&self, consumed_key: &str) -> Result<(Option<Vec<u8>>, BTreeSet<String>)> {
        let raw = self.substrate.get(consumed_key).await?;
        let consumed = match &raw {
            Some(bytes) => self.serializer.deserialize(bytes)?,
            None => BTreeSet::new(),
        };
        Ok((raw, consumed))
    }
}

/// 可消费映射缓存
pub struct ConsumableMapCache<V: CacheValue> {
    inner: Arc<Inner<V>>,
    mutex: KeyScopedMutex<Arc<StoredMap<V>>>,
    max_cas_retries: u32,
}

impl<V: CacheValue> Clone for ConsumableMapCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mutex: self.mutex.clone(),
            max_cas_retries: self.max_cas_retries,
        }
    }
}

fn requested_keys<I, S>(keys: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let requested: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
    if requested.is_empty() {
        return Err(CacheError::InvalidArgument(
            "at least one entry key is required".to_string(),
        ));
    }
    Ok(requested)
}

impl<V: CacheValue> ConsumableMapCache<V> {
    /// 创建可消费映射缓存
    ///
    /// # 参数
    ///
    /// * `context` - 基座与锁参数
    /// * `name` - 缓存名称
    /// * `options` - 缓存选项，`ttl` 决定映射多久后过期
    /// * `partition` - 比较并交换的重试次数
    /// * `loader` - 映射加载器
    pub fn new(
        context: &CacheContext,
        name: &str,
        options: CacheOptions,
        partition: PartitionOptions,
        loader: impl MapLoader<V>,
    ) -> Result<Self> {
        validate_name(name)?;
        if partition.max_cas_retries == 0 {
            return Err(CacheError::Configuration(format!(
                "cache '{}' max_cas_retries cannot be zero",
                name
            )));
        }
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
            max_cas_retries: partition.max_cas_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    async fn map(&self, map_key: &str) -> Result<Arc<StoredMap<V>>> {
        if let Some(stored) = self.inner.read(map_key).await? {
            return Ok(Arc::new(stored));
        }
        let inner = self.inner.clone();
        let owned_key = map_key.to_string();
        self.mutex
            .run_exclusive_once(map_key, move || async move { inner.load(&owned_key).await })
            .await
    }

    /// 检出一组条目
    ///
    /// 所有请求的条目都未被消费时才会成功；任一条目已被消费则返回 `Consumed`，
    /// 并且不修改任何状态。请求了映射中不存在的条目返回 `InvalidArgument`。
    #[instrument(skip(self, keys), level = "debug", fields(cache = %self.inner.name))]
    pub async fn checkout<I, S>(&self, map_key: &str, keys: I) -> Result<BTreeMap<String, V>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_key(map_key)?;
        let requested = requested_keys(keys)?;
        let stored = self.map(map_key).await?;

        let unknown: Vec<String> = requested
            .iter()
            .filter(|k| !stored.entries.contains_key(*k))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "entries {:?} do not exist in '{}'",
                unknown, map_key
            )));
        }

        let consumed_key = self.inner.consumed_key(map_key, &stored.generation);
        for attempt in 1..=self.max_cas_retries {
            let (raw, mut consumed) = self.inner.read_consumed(&consumed_key).await?;
            let taken: Vec<String> = requested.intersection(&consumed).cloned().collect();
            if !taken.is_empty() {
                GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "checkout", "consumed");
                return Err(CacheError::Consumed {
                    map_key: map_key.to_string(),
                    keys: taken,
                });
            }

            consumed.extend(requested.iter().cloned());
            let next = self.inner.serializer.serialize(&consumed)?;
            if self
                .inner
                .substrate
                .compare_and_swap(&consumed_key, raw.as_deref(), next, Some(self.inner.ttl))
                .await?
            {
                GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "checkout", "success");
                return Ok(requested
                    .iter()
                    .filter_map(|k| stored.entries.get(k).map(|v| (k.clone(), v.clone())))
                    .collect());
            }
            debug!(map_key, attempt, "consumed set changed concurrently, retrying");
        }

        GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "checkout", "exhausted");
        Err(CacheError::CoordinationTimeout(format!(
            "checkout of '{}' lost {} compare-and-swap rounds",
            map_key, self.max_cas_retries
        )))
    }

    /// 释放已检出的条目，使其可以再次被检出
    ///
    /// 用于下游步骤失败后的补偿；释放未被消费的条目没有效果。
    #[instrument(skip(self, keys), level = "debug", fields(cache = %self.inner.name))]
    pub async fn release<I, S>(&self, map_key: &str, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_key(map_key)?;
        let requested = requested_keys(keys)?;
        let Some(stored) = self.inner.read(map_key).await? else {
            debug!(map_key, "map expired, nothing to release");
            return Ok(());
        };

        let consumed_key = self.inner.consumed_key(map_key, &stored.generation);
        for attempt in 1..=self.max_cas_retries {
            let (raw, mut consumed) = self.inner.read_consumed(&consumed_key).await?;
            let Some(expected) = raw else {
                return Ok(());
            };
            let before = consumed.len();
            consumed.retain(|k| !requested.contains(k));
            if consumed.len() == before {
                return Ok(());
            }
            let next = self.inner.serializer.serialize(&consumed)?;
            if self
                .inner
                .substrate
                .compare_and_swap(&consumed_key, Some(expected.as_slice()), next, Some(self.inner.ttl))
                .await?
            {
                GLOBAL_METRICS.record_request(&self.inner.name, COMPONENT, "release", "success");
                return Ok(());
            }
            debug!(map_key, attempt, "consumed set changed concurrently, retrying");
        }

        Err(CacheError::CoordinationTimeout(format!(
            "release of '{}' lost {} compare-and-swap rounds",
            map_key, self.max_cas_retries
        )))
    }

    /// 尚未被检出的条目键（必要时加载映射）
    pub async fn available(&self, map_key: &str) -> Result<Vec<String>> {
        validate_key(map_key)?;
        let stored = self.map(map_key).await?;
        let (_, consumed) = self
            .inner
            .read_consumed(&self.inner.consumed_key(map_key, &stored.generation))
            .await?;
        Ok(stored
            .entries
            .keys()
            .filter(|k| !consumed.contains(*k))
            .cloned()
            .collect())
    }

    /// 删除映射及其消费记录
    pub async fn invalidate(&self, map_key: &str) -> Result<()> {
        validate_key(map_key)?;
        if let Some(stored) = self.inner.read(map_key).await? {
            self.inner
                .substrate
                .delete(&self.inner.consumed_key(map_key, &stored.generation))
                .await?;
        }
        self.inner
            .substrate
            .delete(&self.inner.keys.key("map", map_key))
            .await?;
        Ok(())
    }
}
