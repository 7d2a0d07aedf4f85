//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调引擎的日志和链路追踪初始化。

use crate::error::{CacheError, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// 初始化日志输出与 OpenTelemetry Tracing
///
/// 此函数应该在应用程序启动时调用一次。它配置全局 tracer provider，
/// 并安装由日志过滤器、控制台输出和 OpenTelemetry 层组成的 subscriber。
///
/// # 参数
///
/// * `service_name` - 服务名称，作为 tracer 名称
/// * `filter` - 日志过滤表达式（如 `"info,oxcoord=debug"`），`None` 时读取 `RUST_LOG`，默认 `info`
///
/// # 返回值
///
/// 全局 subscriber 已被设置时返回 `Configuration` 错误
pub fn init_tracing(service_name: &str, filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| CacheError::Configuration(format!("invalid log filter: {}", e)))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // 未配置导出器时 provider 不上报，span 仍然会带上 trace 上下文
    let provider = SdkTracerProvider::builder().build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());

    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CacheError::Configuration(format!("tracing already initialized: {}", e)))
}

/// 关闭全局 tracer provider
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
