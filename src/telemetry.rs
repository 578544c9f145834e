//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了日志与链路追踪的初始化。

use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 默认日志过滤规则
pub const DEFAULT_FILTER: &str = "info,oxflash=info";

/// 初始化 tracing 订阅者
///
/// 组合三层：`EnvFilter`（优先读取 `RUST_LOG`，其次使用 `filter`）、
/// 控制台格式化输出、OpenTelemetry 层。未配置导出器时 provider 不导出任何span，
/// span 仍会带上 trace id，便于在日志中串联一次请求。
///
/// 重复调用时保留第一次安装的订阅者。
///
/// # 参数
///
/// * `service_name` - 服务名称，用作 tracer 名
/// * `filter` - 过滤规则，None 时使用 [`DEFAULT_FILTER`]
pub fn init_tracing(service_name: &str, filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

    let provider = SdkTracerProvider::builder().build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .with(telemetry)
        .try_init();
}

/// 关闭全局 tracer provider
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
