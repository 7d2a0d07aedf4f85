//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了按键互斥的单飞（single-flight）原语。
//!
//! 登记表属于实例本身，每个缓存持有自己的 `KeyScopedMutex`，互不共享命名空间。
//! 它只协调本进程内的任务，跨进程互斥需要配合 [`crate::sync::LeaseLock`]。

use crate::error::{CacheError, Result};
use crate::metrics::GLOBAL_METRICS;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

type Outcome<T> = Option<Result<T>>;

/// 登记项的守卫，析构时注销
///
/// 无论动作正常结束、返回错误还是 panic，登记都会被移除。
struct Registration<V> {
    map: Arc<DashMap<String, V>>,
    key: String,
}

impl<V> Drop for Registration<V> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// 按键互斥原语
///
/// * [`run_exclusive_once`](Self::run_exclusive_once)：同一个键同一时刻只执行一次动作，
///   执行期间到达的调用者等待并共享同一个结果。
/// * [`run_at_most_one_concurrent`](Self::run_at_most_one_concurrent)：非阻塞变体，
///   已有后台动作时直接放弃调度。
pub struct KeyScopedMutex<T> {
    scope: Arc<str>,
    exclusive: Arc<DashMap<String, watch::Receiver<Outcome<T>>>>,
    background: Arc<DashMap<String, ()>>,
}

impl<T> Clone for KeyScopedMutex<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            exclusive: self.exclusive.clone(),
            background: self.background.clone(),
        }
    }
}

impl<T> std::fmt::Debug for KeyScopedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyScopedMutex")
            .field("scope", &self.scope)
            .field("exclusive", &self.exclusive.len())
            .field("background", &self.background.len())
            .finish()
    }
}

impl<T> KeyScopedMutex<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 创建新的互斥原语
    ///
    /// # 参数
    ///
    /// * `scope` - 作用域名称，仅用于日志
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: Arc::from(scope.into()),
            exclusive: Arc::new(DashMap::new()),
            background: Arc::new(DashMap::new()),
        }
    }

    /// 同一个键只执行一次动作，所有并发调用者共享结果
    ///
    /// 动作在独立任务中运行：调用者放弃等待不会取消加载，其它等待者仍然能拿到结果。
    /// 动作返回的错误会原样交给所有等待者；动作 panic 时等待者得到 `LoadFailure`。
    ///
    /// # 参数
    ///
    /// * `key` - 互斥键
    /// * `action` - 只有成为领导者的调用者才会调用的动作工厂
    ///
    /// # 返回值
    ///
    /// 返回动作的结果（或与之相同的克隆）
    pub async fn run_exclusive_once<F, Fut>(&self, key: &str, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (mut receiver, leader) = match self.exclusive.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(receiver.clone());
                (receiver, Some(sender))
            }
        };

        match leader {
            Some(sender) => {
                debug!(scope = %self.scope, key, "leading exclusive execution");
                let registration = Registration {
                    map: self.exclusive.clone(),
                    key: key.to_string(),
                };
                let task = action();
                tokio::spawn(async move {
                    let _registration = registration;
                    let outcome = task.await;
                    let _ = sender.send(Some(outcome));
                });
            }
            None => {
                debug!(scope = %self.scope, key, "joining in-flight execution");
            }
        }

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(CacheError::LoadFailure {
                key: key.to_string(),
                message: "execution terminated without producing a result".to_string(),
            })
        })
    }

    /// 非阻塞地为键调度一个后台动作
    ///
    /// 后台动作的错误只会被记录到日志，不会返回给任何调用者。
    ///
    /// # 返回值
    ///
    /// 成功调度返回 `true`；该键已有后台动作在运行时返回 `false`
    pub fn run_at_most_one_concurrent<F, Fut>(&self, key: &str, action: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let registered = match self.background.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(());
                true
            }
        };
        if !registered {
            debug!(scope = %self.scope, key, "background execution already running");
            return false;
        }

        let registration = Registration {
            map: self.background.clone(),
            key: key.to_string(),
        };
        let scope = self.scope.clone();
        let task = action();
        tokio::spawn(async move {
            let registration = registration;
            if let Err(e) = task.await {
                GLOBAL_METRICS.record_request(&scope, "key_mutex", "background", "error");
                warn!(scope = %scope, key = %registration.key, error = %e, "background execution failed");
            }
        });
        true
    }

    /// 当前登记的执行数量（阻塞与后台之和）
    pub fn in_flight(&self) -> usize {
        self.exclusive.len() + self.background.len()
    }

    /// 指定键是否有后台动作在运行
    pub fn is_running_in_background(&self, key: &str) -> bool {
        self.background.contains_key(key)
    }
}
