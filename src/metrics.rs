//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调引擎的指标收集和监控功能。

use dashmap::DashMap;
use lazy_static::lazy_static;
use std::sync::Arc;

/// 指标收集器
///
/// 用于收集和存储缓存组件的各种运行时指标
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 请求总数统计
    /// key: "cache:component:op:result"
    pub requests_total: Arc<DashMap<String, u64>>,
    /// 操作耗时（累积时间和计数，用于计算平均值）
    /// key: "cache:component:op" -> (total_duration_secs, count)
    pub operation_duration: Arc<DashMap<String, (f64, u64)>>,
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

impl Metrics {
    /// 记录请求指标
    ///
    /// # 参数
    ///
    /// * `cache` - 缓存名称
    /// * `component` - 组件类型（loading/distributed/refresh_ahead 等）
    /// * `op` - 操作类型（get/load/take/checkout 等）
    /// * `result` - 操作结果（hit/miss/stale/error 等）
    pub fn record_request(&self, cache: &str, component: &str, op: &str, result: &str) {
        let key = format!("{}:{}:{}:{}", cache, component, op, result);
        *self.requests_total.entry(key).or_insert(0) += 1;
    }

    /// 记录操作耗时
    pub fn record_duration(&self, cache: &str, component: &str, op: &str, duration_secs: f64) {
        let key = format!("{}:{}:{}", cache, component, op);
        let mut entry = self.operation_duration.entry(key).or_insert((0.0, 0));
        entry.0 += duration_secs;
        entry.1 += 1;
    }

    /// 读取某个请求计数
    pub fn request_count(&self, cache: &str, component: &str, op: &str, result: &str) -> u64 {
        let key = format!("{}:{}:{}:{}", cache, component, op, result);
        self.requests_total.get(&key).map(|v| *v).unwrap_or(0)
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为 Prometheus 文本格式返回，用于监控系统采集
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;
    let mut output = String::new();

    for entry in metrics.requests_total.iter() {
        let parts: Vec<&str> = entry.key().split(':').collect();
        if parts.len() == 4 {
            output.push_str(&format!(
                "oxcoord_requests_total{{cache=\"{}\", component=\"{}\", operation=\"{}\", result=\"{}\"}} {}\n",
                parts[0], parts[1], parts[2], parts[3], entry.value()
            ));
        }
    }
    for entry in metrics.operation_duration.iter() {
        let parts: Vec<&str> = entry.key().split(':').collect();
        let (total, count) = *entry.value();
        if parts.len() == 3 {
            output.push_str(&format!(
                "oxcoord_operation_duration_seconds_sum{{cache=\"{}\", component=\"{}\", operation=\"{}\"}} {}\n",
                parts[0], parts[1], parts[2], total
            ));
            output.push_str(&format!(
                "oxcoord_operation_duration_seconds_count{{cache=\"{}\", component=\"{}\", operation=\"{}\"}} {}\n",
                parts[0], parts[1], parts[2], count
            ));
        }
    }
    output
}
