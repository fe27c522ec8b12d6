//! telemetry - 可观测性库

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tiercache_errors::{AppError, AppResult};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化 tracing
///
/// 重复初始化（例如多个测试共用进程）时静默忽略
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// 初始化 JSON 格式的 tracing（生产环境）
pub fn init_tracing_json(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}

/// 初始化 Prometheus metrics，并登记缓存指标的说明
pub fn init_metrics() -> AppResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::configuration(format!("Failed to install Prometheus recorder: {}", e)))?;
    describe_cache_metrics();
    Ok(handle)
}

fn describe_cache_metrics() {
    describe_counter!("cache_requests_total", "Cache reads by tier and result");
    describe_counter!("cache_writes_total", "Cache writes by mode (local / sync / async)");
    describe_counter!(
        "cache_sync_events_total",
        "Sync events published, received or dropped"
    );
    describe_counter!("cache_circuit_transitions_total", "Circuit breaker state changes");
    describe_counter!(
        "cache_penetration_blocked_total",
        "Reads rejected by the bloom filter"
    );
    describe_gauge!("cache_local_entries", "Entries held by each local tier");
}

/// Metrics 记录器
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// 安装全局 recorder 并创建记录器
    pub fn install() -> AppResult<Self> {
        Ok(Self {
            handle: init_metrics()?,
        })
    }

    /// 获取 Prometheus 格式的 metrics
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
