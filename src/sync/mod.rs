//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调引擎的同步原语：进程内的按键单飞互斥，以及基于基座的租约锁。

pub mod key_mutex;
pub mod lease_lock;

pub use key_mutex::KeyScopedMutex;
pub use lease_lock::{LeaseGuard, LeaseLock};
