//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调引擎的配置结构和解析逻辑。
//!
//! 配置以 TOML 文件给出，分为全局配置、基座配置和按名称索引的缓存配置三部分。
//! 所有构造期规则都集中在 [`Config::validate`] 中检查。

use crate::error::{CacheError, Result};
use crate::serialization::SerializerEnum;
use crate::utils::validate_name;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;
pub const CONFIG_VERSION_FIELD: &str = "config_version";

/// 最长允许的TTL（30天）
const MAX_TTL_MS: u64 = 86_400_000 * 30;

/// 顶层配置
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub config_version: Option<u32>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub substrate: SubstrateConfig,
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
}

/// 全局配置
///
/// 定义适用于所有缓存的默认配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GlobalConfig {
    /// 基座键的命名空间前缀
    pub namespace: String,
    /// 默认的缓存过期时间（毫秒）
    pub default_ttl_ms: u64,
    /// 默认序列化类型
    pub serialization: SerializationType,
    /// 分布式租约锁参数
    pub lock: LockOptions,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            namespace: "oxcoord".to_string(),
            default_ttl_ms: 300_000,
            serialization: SerializationType::Json,
            lock: LockOptions::default(),
        }
    }
}

/// 租约锁参数
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LockOptions {
    /// 租约时长（毫秒），持有者崩溃后锁最多保留这么久
    pub lease_ms: u64,
    /// 获取锁的最长等待时间（毫秒）
    pub wait_timeout_ms: u64,
    /// 获取失败后的重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_ms: 20_000,
            wait_timeout_ms: 20_000,
            retry_interval_ms: 50,
        }
    }
}

impl LockOptions {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.lease_ms == 0 {
            return Err(config_error("lock lease_ms cannot be zero"));
        }
        if self.wait_timeout_ms == 0 {
            return Err(config_error("lock wait_timeout_ms cannot be zero"));
        }
        if self.retry_interval_ms == 0 || self.retry_interval_ms > self.wait_timeout_ms {
            return Err(config_error(
                "lock retry_interval_ms must be between 1 and wait_timeout_ms",
            ));
        }
        Ok(())
    }
}

/// 序列化类型枚举
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerializationType {
    /// JSON序列化
    #[default]
    Json,
    /// gzip压缩的JSON序列化
    JsonCompressed,
}

/// 基座类型
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateMode {
    /// 进程内存储，仅在单进程内共享
    #[default]
    Memory,
    /// Redis存储，集群内所有进程共享
    Redis,
}

/// 基座配置
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct SubstrateConfig {
    pub mode: SubstrateMode,
    pub redis: Option<RedisConfig>,
}

/// Redis模式
#[derive(Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    #[default]
    Standalone,
    Cluster,
}

/// Redis连接配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis模式
    pub mode: RedisMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
    /// Redis 密码（可选，使用 SecretString 保护）
    pub password: Option<SecretString>,
    /// 是否启用 TLS
    pub enable_tls: bool,
    /// 集群配置
    pub cluster: Option<ClusterConfig>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: RedisMode::Standalone,
            connection_string: SecretString::new("redis://127.0.0.1:6379".to_string().into()),
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
            password: None,
            enable_tls: false,
            cluster: None,
        }
    }
}

/// 集群配置
#[derive(Deserialize, Clone, Debug)]
pub struct ClusterConfig {
    /// 初始节点列表
    pub nodes: Vec<String>,
}

/// 缓存组件类型
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// 进程内加载缓存
    Loading,
    /// 基座共享的加载缓存
    Distributed,
    /// 进程内缓存在前、共享缓存在后的两级缓存
    Tiered,
    /// 逻辑/物理双TTL的预刷新缓存
    RefreshAhead,
    /// 可消费列表
    ConsumableList,
    /// 可消费映射
    ConsumableMap,
    /// 定长集合
    Bounded,
    /// 原子计数器
    Counter,
}

/// 单个缓存的配置
#[derive(Deserialize, Clone, Debug)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// 序列化类型，可覆盖全局配置
    #[serde(default)]
    pub serialization: Option<SerializationType>,
    /// 是否允许缓存空值
    #[serde(default = "default_allow_nulls")]
    pub allow_nulls: bool,
    /// 过期时间（毫秒），可覆盖全局配置
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// 定长集合容量
    #[serde(default)]
    pub capacity: Option<usize>,
    /// 进程内缓存的最大条目数
    #[serde(default)]
    pub max_entries: Option<u64>,
    /// 预刷新缓存参数
    #[serde(default)]
    pub refresh: Option<RefreshAheadOptions>,
    /// 可消费分区参数
    #[serde(default)]
    pub partition: Option<PartitionOptions>,
}

fn default_allow_nulls() -> bool {
    true
}

/// 预刷新缓存的双TTL参数
///
/// 必须满足 `physical_ttl_ms > logical_ttl_ms > 0`。
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RefreshAheadOptions {
    /// 逻辑过期时间（毫秒），超过后条目视为陈旧但仍可用
    pub logical_ttl_ms: u64,
    /// 物理过期时间（毫秒），超过后条目被基座清除
    pub physical_ttl_ms: u64,
    /// 缺失路径上的最大重试次数
    #[serde(default = "default_refresh_retries")]
    pub max_retries: u32,
}

fn default_refresh_retries() -> u32 {
    5
}

impl RefreshAheadOptions {
    pub fn new(logical: Duration, physical: Duration) -> Self {
        Self {
            logical_ttl_ms: logical.as_millis() as u64,
            physical_ttl_ms: physical.as_millis() as u64,
            max_retries: default_refresh_retries(),
        }
    }

    pub fn logical_ttl(&self) -> Duration {
        Duration::from_millis(self.logical_ttl_ms)
    }

    pub fn physical_ttl(&self) -> Duration {
        Duration::from_millis(self.physical_ttl_ms)
    }

    /// 检查双TTL约束
    pub fn validate(&self) -> Result<()> {
        if self.logical_ttl_ms == 0 {
            return Err(config_error("logical_ttl_ms must be positive"));
        }
        if self.physical_ttl_ms <= self.logical_ttl_ms {
            return Err(config_error(format!(
                "physical_ttl_ms ({}) must be greater than logical_ttl_ms ({})",
                self.physical_ttl_ms, self.logical_ttl_ms
            )));
        }
        if self.physical_ttl_ms > MAX_TTL_MS {
            return Err(config_error("physical_ttl_ms cannot exceed 30 days"));
        }
        if self.max_retries == 0 {
            return Err(config_error("refresh max_retries cannot be zero"));
        }
        Ok(())
    }
}

/// 可消费分区参数
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PartitionOptions {
    /// 列表耗尽后自动重新加载的最大次数
    pub max_reloads: u32,
    /// 映射检出时比较并交换的最大重试次数
    pub max_cas_retries: u32,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            max_reloads: 1,
            max_cas_retries: 16,
        }
    }
}

/// 缓存组件的运行期选项
///
/// 由配置文件中的 [`CacheConfig`] 生成，也可以直接用构造方法搭建。
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// 值的编解码器
    pub serializer: SerializerEnum,
    /// 是否允许缓存空值
    pub allow_nulls: bool,
    /// 条目（或整个集合）的过期时间
    pub ttl: Option<Duration>,
    /// 定长集合容量
    pub capacity: Option<usize>,
    /// 进程内缓存的最大条目数
    pub max_entries: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            serializer: SerializerEnum::default(),
            allow_nulls: true,
            ttl: None,
            capacity: None,
            max_entries: 10_000,
        }
    }
}

impl CacheOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_allow_nulls(mut self, allow_nulls: bool) -> Self {
        self.allow_nulls = allow_nulls;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerEnum) -> Self {
        self.serializer = serializer;
        self
    }

    /// 返回配置的TTL，未配置时使用 `fallback`
    pub fn ttl_or(&self, fallback: Duration) -> Duration {
        self.ttl.unwrap_or(fallback)
    }
}

impl CacheConfig {
    /// 结合全局默认值生成运行期选项
    ///
    /// 只有定长集合在未显式配置TTL时保持不过期，其它组件回落到全局默认TTL。
    pub fn options(&self, global: &GlobalConfig) -> CacheOptions {
        let serialization = self
            .serialization
            .clone()
            .unwrap_or_else(|| global.serialization.clone());
        let ttl_ms = match (self.ttl_ms, self.kind) {
            (Some(ttl), _) => Some(ttl),
            (None, CacheKind::Bounded) => None,
            (None, _) => Some(global.default_ttl_ms),
        };
        CacheOptions {
            serializer: SerializerEnum::for_type(&serialization),
            allow_nulls: self.allow_nulls,
            ttl: ttl_ms.map(Duration::from_millis),
            capacity: self.capacity,
            max_entries: self.max_entries.unwrap_or(10_000),
        }
    }
}

fn config_error(msg: impl Into<String>) -> CacheError {
    CacheError::Configuration(msg.into())
}

impl Config {
    /// 解析并验证 TOML 配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件读取配置
    ///
    /// # 参数
    ///
    /// * `path` - 配置文件路径
    ///
    /// # 返回值
    ///
    /// 返回验证通过的配置或错误
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            config_error(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有必需的字段都已设置，并且值在合理范围内
    pub fn validate(&self) -> Result<()> {
        if let Some(version) = &self.config_version {
            if *version > CONFIG_VERSION {
                return Err(config_error(format!(
                    "Configuration version {} is not supported. Current version is {}.",
                    version, CONFIG_VERSION
                )));
            }
        }

        validate_name(&self.global.namespace)?;

        if self.global.default_ttl_ms == 0 {
            return Err(config_error("Global default_ttl_ms cannot be zero"));
        }
        if self.global.default_ttl_ms > MAX_TTL_MS {
            return Err(config_error("Global default_ttl_ms cannot exceed 30 days"));
        }
        self.global.lock.validate()?;

        if self.substrate.mode == SubstrateMode::Redis {
            let redis = self.substrate.redis.as_ref().ok_or_else(|| {
                config_error("substrate mode 'redis' requires a [substrate.redis] section")
            })?;

            if !(100..=30000).contains(&redis.connection_timeout_ms) {
                return Err(config_error(
                    "redis connection_timeout_ms must be between 100 and 30000 ms",
                ));
            }
            if !(100..=60000).contains(&redis.command_timeout_ms) {
                return Err(config_error(
                    "redis command_timeout_ms must be between 100 and 60000 ms",
                ));
            }
            if redis.mode == RedisMode::Cluster
                && redis.cluster.as_ref().map_or(true, |c| c.nodes.is_empty())
            {
                return Err(config_error("redis cluster mode requires at least one node"));
            }
        }

        for (name, cache) in &self.caches {
            validate_name(name)?;

            if let Some(ttl) = cache.ttl_ms {
                if ttl == 0 {
                    return Err(config_error(format!("Cache '{}' ttl_ms cannot be zero", name)));
                }
                if ttl > MAX_TTL_MS {
                    return Err(config_error(format!(
                        "Cache '{}' ttl_ms cannot exceed 30 days",
                        name
                    )));
                }
            }

            if cache.max_entries == Some(0) {
                return Err(config_error(format!(
                    "Cache '{}' max_entries cannot be zero",
                    name
                )));
            }

            match cache.kind {
                CacheKind::RefreshAhead => {
                    let refresh = cache.refresh.as_ref().ok_or_else(|| {
                        config_error(format!(
                            "Cache '{}' of kind refresh_ahead requires a [refresh] section",
                            name
                        ))
                    })?;
                    refresh
                        .validate()
                        .map_err(|e| config_error(format!("Cache '{}': {}", name, e)))?;
                }
                CacheKind::Bounded => match cache.capacity {
                    Some(capacity) if capacity > 0 => {}
                    _ => {
                        return Err(config_error(format!(
                            "Cache '{}' of kind bounded requires a positive capacity",
                            name
                        )))
                    }
                },
                CacheKind::ConsumableMap => {
                    if cache
                        .partition
                        .as_ref()
                        .map_or(false, |p| p.max_cas_retries == 0)
                    {
                        return Err(config_error(format!(
                            "Cache '{}' max_cas_retries cannot be zero",
                            name
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// 查找指定名称的缓存配置
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.get(name)
    }
}
