//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于KV基座的租约分布式锁。
//!
//! 加锁是带令牌和租约的"不存在才写入"，解锁是"值等于令牌才删除"，
//! 持有者崩溃时锁最多保留一个租约时长。

use crate::config::LockOptions;
use crate::error::{CacheError, Result};
use crate::substrate::KvSubstrate;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// 租约锁
#[derive(Clone)]
pub struct LeaseLock {
    substrate: Arc<dyn KvSubstrate>,
    options: LockOptions,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("substrate", &self.substrate.name())
            .field("options", &self.options)
            .finish()
    }
}

impl LeaseLock {
    pub fn new(substrate: Arc<dyn KvSubstrate>, options: LockOptions) -> Self {
        Self { substrate, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// 获取锁，最多等待配置的 `wait_timeout_ms`
    pub async fn acquire(&self, name: &str) -> Result<LeaseGuard> {
        self.acquire_with_timeout(name, self.options.wait_timeout())
            .await
    }

    /// 获取锁，最多等待 `timeout`
    ///
    /// 超时返回 `CoordinationTimeout`，调用者不得绕过锁继续执行。
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_with_timeout(&self, name: &str, timeout: Duration) -> Result<LeaseGuard> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self
                .substrate
                .set_if_absent(name, token.clone().into_bytes(), Some(self.options.lease()))
                .await?
            {
                debug!(attempts, "lease acquired");
                return Ok(LeaseGuard::new(self.substrate.clone(), name, token));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, timeout_ms = timeout.as_millis() as u64, "lease acquisition timed out");
                return Err(CacheError::CoordinationTimeout(format!(
                    "could not acquire lock '{}' within {}ms",
                    name,
                    timeout.as_millis()
                )));
            }
            let pause = self.options.retry_interval().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// 只尝试一次获取锁
    ///
    /// # 返回值
    ///
    /// 获取成功返回守卫，锁被他人持有时返回 `None`
    pub async fn try_acquire(&self, name: &str) -> Result<Option<LeaseGuard>> {
        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .substrate
            .set_if_absent(name, token.clone().into_bytes(), Some(self.options.lease()))
            .await?;
        Ok(acquired.then(|| LeaseGuard::new(self.substrate.clone(), name, token)))
    }
}

/// 已持有的租约
///
/// 应当显式调用 [`release`](Self::release)；若守卫被直接丢弃，会在后台尝试释放。
pub struct LeaseGuard {
    substrate: Arc<dyn KvSubstrate>,
    name: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LeaseGuard {
    fn new(substrate: Arc<dyn KvSubstrate>, name: &str, token: String) -> Self {
        Self {
            substrate,
            name: name.to_string(),
            token,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 释放锁
    ///
    /// # 返回值
    ///
    /// 锁仍由本守卫持有并被删除返回 `true`；租约已过期或被他人接管返回 `false`
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self
            .substrate
            .delete_if_equals(&self.name, self.token.as_bytes())
            .await?;
        if !released {
            warn!(lock = %self.name, "lease expired before release");
        }
        Ok(released)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let substrate = self.substrate.clone();
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = substrate.delete_if_equals(&name, token.as_bytes()).await {
                        warn!(lock = %name, error = %e, "failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %name, "lease dropped outside runtime, left to expire");
            }
        }
    }
}
