//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存组件共用的接口、数据模型和上下文。
//!
//! 各组件彼此独立，只共享 [`KeyScopedMutex`](crate::sync::KeyScopedMutex) 与
//! [`KvSubstrate`]；两级部署时 [`TieredCache`] 把进程内缓存串在共享缓存之前。

pub mod bounded;
pub mod consumable_list;
pub mod consumable_map;
pub mod counter;
pub mod distributed;
pub mod loading;
pub mod refresh_ahead;
pub mod tiered;

pub use bounded::BoundedCollectionCache;
pub use consumable_list::ConsumableListCache;
pub use consumable_map::ConsumableMapCache;
pub use counter::AtomicCounterCache;
pub use distributed::DistributedLoadingCache;
pub use loading::LoadingCache;
pub use refresh_ahead::RefreshAheadCache;
pub use tiered::TieredCache;

use crate::config::LockOptions;
use crate::error::{CacheError, Result};
use crate::substrate::KvSubstrate;
use crate::sync::LeaseLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 可缓存值的约束集合
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// 缓存条目
///
/// `value` 为 `None` 表示可缓存的空结果（负缓存）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: Option<V>,
    pub loaded_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn new(key: &str, value: Option<V>) -> Self {
        Self {
            key: key.to_string(),
            value,
            loaded_at: Utc::now(),
        }
    }

    /// 条目自加载以来的年龄，时钟回拨时视为0
    pub fn age(&self) -> Duration {
        (Utc::now() - self.loaded_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// 单值加载器
///
/// 返回 `Ok(None)` 表示源数据不存在；返回错误时不会写入缓存。
#[async_trait]
pub trait Loader<V>: Send + Sync + 'static {
    async fn load(&self, key: &str) -> anyhow::Result<Option<V>>;
}

#[async_trait]
impl<V, F, Fut> Loader<V> for F
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<V>>> + Send + 'static,
{
    async fn load(&self, key: &str) -> anyhow::Result<Option<V>> {
        (self)(key.to_string()).await
    }
}

/// 批量加载器，用于可消费列表
#[async_trait]
pub trait BatchLoader<V>: Send + Sync + 'static {
    async fn load_batch(&self, key: &str) -> anyhow::Result<Vec<V>>;
}

#[async_trait]
impl<V, F, Fut> BatchLoader<V> for F
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
{
    async fn load_batch(&self, key: &str) -> anyhow::Result<Vec<V>> {
        (self)(key.to_string()).await
    }
}

/// 映射加载器，用于可消费映射
#[async_trait]
pub trait MapLoader<V>: Send + Sync + 'static {
    async fn load_map(&self, key: &str) -> anyhow::Result<BTreeMap<String, V>>;
}

#[async_trait]
impl<V, F, Fut> MapLoader<V> for F
where
    V: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<BTreeMap<String, V>>> + Send + 'static,
{
    async fn load_map(&self, key: &str) -> anyhow::Result<BTreeMap<String, V>> {
        (self)(key.to_string()).await
    }
}

/// 计数器初值加载器
#[async_trait]
pub trait CounterLoader: Send + Sync + 'static {
    async fn initial_value(&self, key: &str) -> anyhow::Result<i64>;
}

#[async_trait]
impl<F, Fut> CounterLoader for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<i64>> + Send + 'static,
{
    async fn initial_value(&self, key: &str) -> anyhow::Result<i64> {
        (self)(key.to_string()).await
    }
}

/// 缓存基本操作
///
/// 进程内、共享和两级缓存都实现此接口，两级缓存的后端层通过它访问。
#[async_trait]
pub trait CacheOps<V>: Send + Sync {
    /// 缓存名称
    fn name(&self) -> &str;

    /// 读取值，未命中时调用加载器
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// 直接写入值
    async fn put(&self, key: &str, value: Option<V>) -> Result<()>;

    /// 使单个键失效
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// 使全部键失效
    async fn invalidate_all(&self) -> Result<()>;
}

/// 失效事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    All,
}

/// 失效监听器
///
/// 在条目被移除之后调用，两级缓存用它把失效传递到后端层。
#[async_trait]
pub trait InvalidationListener: Send + Sync {
    async fn on_invalidate(&self, cache: &str, event: &Invalidation) -> Result<()>;
}

/// 监听器列表
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn InvalidationListener>>>>,
}

impl Listeners {
    pub async fn add(&self, listener: Arc<dyn InvalidationListener>) {
        self.inner.write().await.push(listener);
    }

    /// 依次通知所有监听器
    ///
    /// 所有监听器都会被调用；返回遇到的第一个错误。
    pub async fn notify(&self, cache: &str, event: &Invalidation) -> Result<()> {
        let listeners: Vec<_> = self.inner.read().await.iter().cloned().collect();
        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.on_invalidate(cache, event).await {
                tracing::warn!(cache, error = %e, "invalidation listener failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// 基座键空间
///
/// 键格式为 `{namespace}:{cache}:{part}:{key}`。
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(namespace: &str, cache: &str) -> Self {
        Self {
            prefix: format!("{}:{}", namespace, cache),
        }
    }

    pub fn key(&self, part: &str, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, part, key)
    }

    pub fn part_prefix(&self, part: &str) -> String {
        format!("{}:{}:", self.prefix, part)
    }
}

/// 缓存组件的共享上下文
///
/// 持有基座、命名空间和锁参数，由 [`Coordinator`](crate::Coordinator) 创建，
/// 也可以直接构造用于单独使用某个组件。
#[derive(Clone)]
pub struct CacheContext {
    pub namespace: String,
    pub substrate: Arc<dyn KvSubstrate>,
    pub lock: LockOptions,
}

impl CacheContext {
    pub fn new(substrate: Arc<dyn KvSubstrate>) -> Self {
        Self {
            namespace: "oxcoord".to_string(),
            substrate,
            lock: LockOptions::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub(crate) fn key_space(&self, cache: &str) -> KeySpace {
        KeySpace::new(&self.namespace, cache)
    }

    pub(crate) fn lease_lock(&self) -> LeaseLock {
        LeaseLock::new(self.substrate.clone(), self.lock.clone())
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("namespace", &self.namespace)
            .field("substrate", &self.substrate.name())
            .field("lock", &self.lock)
            .finish()
    }
}

/// 拒绝空值的缓存收到空值时返回 `InvalidArgument`
pub(crate) fn check_nullable<V>(allow_nulls: bool, key: &str, value: &Option<V>) -> Result<()> {
    if value.is_none() && !allow_nulls {
        return Err(CacheError::InvalidArgument(format!(
            "null value for key '{}' is not allowed in this cache",
            key
        )));
    }
    Ok(())
}

/// 解析基座中按十进制文本存放的整数，无法解析时返回 `Serialization`
pub(crate) fn parse_integer(what: &str, key: &str, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            CacheError::Serialization(format!("{} '{}' does not hold an integer", what, key))
        })
}
