//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了定长集合缓存：每个键一个最新优先的列表，超出容量时丢弃最旧元素。

use super::{CacheContext, CacheValue, KeySpace};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use crate::serialization::{Serializer, SerializerEnum};
use crate::substrate::KvSubstrate;
use crate::utils::{validate_key, validate_name};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const COMPONENT: &str = "bounded";

/// 定长集合缓存
///
/// 插入与裁剪在基座中是同一个原子步骤。默认不过期；配置了 `ttl` 时整个集合一起过期，
/// 每次写入都会续期。
pub struct BoundedCollectionCache<V: CacheValue> {
    name: String,
    keys: KeySpace,
    substrate: Arc<dyn KvSubstrate>,
    serializer: SerializerEnum,
    capacity: usize,
    ttl: Option<Duration>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: CacheValue> Clone for BoundedCollectionCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            keys: self.keys.clone(),
            substrate: self.substrate.clone(),
            serializer: self.serializer.clone(),
            capacity: self.capacity,
            ttl: self.ttl,
            _marker: PhantomData,
        }
    }
}

impl<V: CacheValue> BoundedCollectionCache<V> {
    /// 创建定长集合缓存
    ///
    /// # 返回值
    ///
    /// `options.capacity` 缺失或为0时返回 `InvalidArgument`
    pub fn new(context: &CacheContext, name: &str, options: CacheOptions) -> Result<Self> {
        validate_name(name)?;
        let capacity = match options.capacity {
            Some(capacity) if capacity > 0 => capacity,
            _ => {
                return Err(CacheError::InvalidArgument(format!(
                    "bounded collection '{}' requires a positive capacity",
                    name
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            keys: context.key_space(name),
            substrate: context.substrate.clone(),
            serializer: options.serializer,
            capacity,
            ttl: options.ttl,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 把值放到集合最前面
    pub async fn push(&self, key: &str, value: V) -> Result<()> {
        self.push_all(key, vec![value]).await
    }

    /// 依次压入多个值，最后一个值位于最前面
    #[instrument(skip(self, values), level = "debug", fields(cache = %self.name, count = values.len()))]
    pub async fn push_all(&self, key: &str, values: Vec<V>) -> Result<()> {
        validate_key(key)?;
        if values.is_empty() {
            return Err(CacheError::InvalidArgument(
                "push_all requires at least one value".to_string(),
            ));
        }
        let encoded = values
            .iter()
            .map(|v| self.serializer.serialize(v))
            .collect::<Result<Vec<_>>>()?;
        self.substrate
            .push_capped(&self.keys.key("list", key), encoded, self.capacity, self.ttl)
            .await?;
        GLOBAL_METRICS.record_request(&self.name, COMPONENT, "push", "success");
        Ok(())
    }

    /// 读取集合，最新的元素在前
    pub async fn get(&self, key: &str) -> Result<Vec<V>> {
        validate_key(key)?;
        self.substrate
            .list_all(&self.keys.key("list", key))
            .await?
            .iter()
            .map(|bytes| self.serializer.deserialize(bytes))
            .collect()
    }

    /// 集合当前大小
    pub async fn size(&self, key: &str) -> Result<usize> {
        validate_key(key)?;
        self.substrate.list_len(&self.keys.key("list", key)).await
    }

    /// 删除集合
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.substrate.delete(&self.keys.key("list", key)).await?;
        Ok(())
    }
}
