//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了KV存储基座（substrate）的抽象接口及其实现。
//!
//! 所有跨进程共享的状态都只存在于基座中。缓存组件只依赖 [`KvSubstrate`]，
//! 原子条件写入、计数器和有界列表等原语由各个适配器用其存储自身的机制实现。

pub mod memory;
pub mod redis_store;
pub mod redis_provider;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemorySubstrate;
pub use redis_store::RedisSubstrate;

/// KV存储基座特征
///
/// 以字符串为键、字节串为值的存储，支持可选的按键过期时间。
/// 所有方法必须在并发调用（包括跨进程）下保持原子性。
#[async_trait]
pub trait KvSubstrate: Send + Sync {
    /// 读取键值，不存在或已过期返回 `None`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// 写入键值，`ttl` 为 `None` 时不过期
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> Result<bool>;

    /// 检查键是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 仅当键不存在时写入
    ///
    /// # 返回值
    ///
    /// 写入成功返回 `true`，键已存在返回 `false`
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<bool>;

    /// 比较并交换
    ///
    /// 当前值等于 `expected` 时写入 `value`；`expected` 为 `None` 表示要求键不存在。
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// 当前值等于 `expected` 时删除键（用于释放租约锁）
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// 原子递增计数器并返回新值
    ///
    /// 不存在的计数器从0开始；`ttl` 只在计数器尚无过期时间时设置。
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64>;

    /// 仅当计数器存在时原子递增，不存在返回 `None` 且不创建
    async fn increment_existing(&self, key: &str, delta: i64) -> Result<Option<i64>>;

    /// 将元素依次压入列表头部，并在同一个原子步骤内裁剪到 `capacity` 个元素
    ///
    /// 最后压入的元素位于列表最前面。`ttl` 作用于整个列表。
    async fn push_capped(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// 用 `values` 整体替换列表（顺序保持不变），空 `values` 等同于删除
    async fn list_replace(&self, key: &str, values: Vec<Vec<u8>>, ttl: Option<Duration>)
        -> Result<()>;

    /// 读取列表 `[start, end)` 区间的元素，越界部分被忽略
    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<Vec<u8>>>;

    /// 读取列表全部元素（头部在前）
    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// 列表长度
    async fn list_len(&self, key: &str) -> Result<usize>;

    /// 删除所有以 `prefix` 开头的键，返回删除数量
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// 检查基座是否可用
    async fn ping(&self) -> Result<()>;

    /// 基座名称，用于日志和指标
    fn name(&self) -> &'static str;
}
