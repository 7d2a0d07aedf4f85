//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了进程内KV基座的实现。
//!
//! 所有键保存在一个互斥锁保护的表中，每个操作在持锁期间完成，因此天然满足原子性。
//! 过期键在访问时惰性清除，另外每 [`SWEEP_INTERVAL`] 次写入整体清扫一次，
//! 不再被访问的过期键不会一直留在表中。多个缓存实例共享同一个 `MemorySubstrate` 即可模拟一个共享存储的集群。

use super::KvSubstrate;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};

/// 两次整体清扫之间的写入次数
pub const SWEEP_INTERVAL: usize = 64;

#[derive(Debug, Clone)]
enum SlotValue {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: SlotValue,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: SlotValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// 进程内KV基座
#[derive(Debug, Default)]
pub struct MemorySubstrate {
    slots: Mutex<HashMap<String, Slot>>,
    writes: AtomicUsize,
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Substrate(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

impl MemorySubstrate {
    /// 创建空的进程内基座
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| CacheError::Substrate(format!("memory substrate poisoned: {}", e)))
    }

    /// 取出未过期的槽位，顺带清除已过期的槽位
    fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
        let now = Instant::now();
        if slots.get(key).map(|s| s.is_expired(now)).unwrap_or(false) {
            slots.remove(key);
        }
        slots.get_mut(key)
    }

    /// 记录一次写入，每 `SWEEP_INTERVAL` 次写入清扫全部过期槽位
    fn note_write(&self, slots: &mut HashMap<String, Slot>) {
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            let removed = Self::sweep(slots);
            if removed > 0 {
                trace!(removed, remaining = slots.len(), "swept expired slots");
            }
        }
    }

    fn sweep(slots: &mut HashMap<String, Slot>) -> usize {
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        before - slots.len()
    }

    fn add_to(slot: &mut Slot, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let current = match &slot.value {
            SlotValue::Bytes(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| {
                    CacheError::Substrate(format!("value of '{}' is not an integer", key))
                })?,
            SlotValue::List(_) => return Err(wrong_type(key)),
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            CacheError::Substrate(format!("increment of '{}' would overflow", key))
        })?;
        slot.value = SlotValue::Bytes(next.to_string().into_bytes());
        if slot.expires_at.is_none() {
            slot.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        }
        Ok(next)
    }

    /// 立即清除全部过期槽位，返回清除数量
    pub fn purge_expired(&self) -> Result<usize> {
        let mut slots = self.lock()?;
        Ok(Self::sweep(&mut slots))
    }

    /// 当前存储的键数量（包含尚未被清除的过期键）
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvSubstrate for MemorySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut slots = self.lock()?;
        match Self::live(&mut slots, key) {
            None => Ok(None),
            Some(Slot {
                value: SlotValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut slots = self.lock()?;
        slots.insert(key.to_string(), Slot::new(SlotValue::Bytes(value), ttl));
        self.note_write(&mut slots);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut slots = self.lock()?;
        let existed = Self::live(&mut slots, key).is_some();
        slots.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut slots = self.lock()?;
        Ok(Self::live(&mut slots, key).is_some())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut slots = self.lock()?;
        if Self::live(&mut slots, key).is_some() {
            return Ok(false);
        }
        slots.insert(key.to_string(), Slot::new(SlotValue::Bytes(value), ttl));
        self.note_write(&mut slots);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut slots = self.lock()?;
        let matches = match (Self::live(&mut slots, key), expected) {
            (None, None) => true,
            (
                Some(Slot {
                    value: SlotValue::Bytes(current),
                    ..
                }),
                Some(expected),
            ) => current.as_slice() == expected,
            (Some(Slot { value: SlotValue::List(_), .. }), _) => return Err(wrong_type(key)),
            _ => false,
        };
        if matches {
            slots.insert(key.to_string(), Slot::new(SlotValue::Bytes(value), ttl));
            self.note_write(&mut slots);
        }
        Ok(matches)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut slots = self.lock()?;
        let matches = matches!(
            Self::live(&mut slots, key),
            Some(Slot { value: SlotValue::Bytes(current), .. }) if current.as_slice() == expected
        );
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    #[instrument(skip(self), level = "trace")]
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        let mut slots = self.lock()?;
        let next = match Self::live(&mut slots, key) {
            None => {
                slots.insert(
                    key.to_string(),
                    Slot::new(SlotValue::Bytes(delta.to_string().into_bytes()), ttl),
                );
                delta
            }
            Some(slot) => Self::add_to(slot, key, delta, ttl)?,
        };
        self.note_write(&mut slots);
        Ok(next)
    }

    async fn increment_existing(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let mut slots = self.lock()?;
        let next = match Self::live(&mut slots, key) {
            None => return Ok(None),
            Some(slot) => Self::add_to(slot, key, delta, None)?,
        };
        self.note_write(&mut slots);
        Ok(Some(next))
    }

    async fn push_capped(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut slots = self.lock()?;
        if Self::live(&mut slots, key).is_none() {
            slots.insert(
                key.to_string(),
                Slot::new(SlotValue::List(VecDeque::new()), None),
            );
        }
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| CacheError::Substrate(format!("list '{}' vanished", key)))?;
        let list = match &mut slot.value {
            SlotValue::List(list) => list,
            SlotValue::Bytes(_) => return Err(wrong_type(key)),
        };
        for value in values {
            list.push_front(value);
        }
        let dropped = list.len().saturating_sub(capacity);
        list.truncate(capacity);
        if let Some(ttl) = ttl {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        if dropped > 0 {
            debug!(key, dropped, "trimmed bounded list");
        }
        self.note_write(&mut slots);
        Ok(())
    }

    async fn list_replace(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut slots = self.lock()?;
        if values.is_empty() {
            slots.remove(key);
        } else {
            slots.insert(
                key.to_string(),
                Slot::new(SlotValue::List(values.into_iter().collect()), ttl),
            );
        }
        self.note_write(&mut slots);
        Ok(())
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<Vec<u8>>> {
        let mut slots = self.lock()?;
        match Self::live(&mut slots, key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: SlotValue::List(list),
                ..
            }) => Ok(list.iter().skip(start).take(end.saturating_sub(start)).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_all(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut slots = self.lock()?;
        match Self::live(&mut slots, key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: SlotValue::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut slots = self.lock()?;
        match Self::live(&mut slots, key) {
            None => Ok(0),
            Some(Slot {
                value: SlotValue::List(list),
                ..
            }) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut slots = self.lock()?;
        let now = Instant::now();
        let before = slots.len();
        let mut expired = 0u64;
        slots.retain(|key, slot| {
            if !key.starts_with(prefix) {
                return true;
            }
            if slot.is_expired(now) {
                expired += 1;
            }
            false
        });
        Ok((before - slots.len()) as u64 - expired)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
