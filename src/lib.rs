//! oxcoord - 缓存协调引擎
//!
//! 位于调用者与昂贵计算（或远程存储的值）之间，保证：
//!
//! - 同一个键的并发调用者只触发一次计算（单飞）；
//! - 条目可以在后台刷新期间以轻微陈旧的状态继续提供服务；
//! - 预先计算好的批次可以分发给大量并发消费者，每个元素恰好交付一次。
//!
//! 跨进程共享的状态只存在于可插拔的 KV 基座（[`substrate::KvSubstrate`]）中，
//! 内置进程内实现与 Redis 实现。

#![doc(html_root_url = "https://docs.rs/oxcoord/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod serialization;
pub mod substrate;
pub mod sync;
pub mod telemetry;
pub mod utils;

// Re-export commonly used items
pub use cache::{
    AtomicCounterCache, BoundedCollectionCache, CacheContext, CacheEntry, CacheOps,
    ConsumableListCache, ConsumableMapCache, DistributedLoadingCache, LoadingCache,
    RefreshAheadCache, TieredCache,
};
pub use config::{CacheOptions, Config, LockOptions, PartitionOptions, RefreshAheadOptions};
pub use error::{CacheError, Result};
pub use manager::Coordinator;
pub use substrate::{KvSubstrate, MemorySubstrate, RedisSubstrate};
pub use sync::{KeyScopedMutex, LeaseLock};

/// oxcoord 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
