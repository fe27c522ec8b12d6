//! 缓存指标
//!
//! 未安装 recorder 时所有调用都是空操作

use ::metrics::{counter, gauge};

/// 记录一次层读取
pub fn record_request(cache: &str, tier: &'static str, hit: bool) {
    let labels = [
        ("cache", cache.to_string()),
        ("tier", tier.to_string()),
        ("result", if hit { "hit" } else { "miss" }.to_string()),
    ];

    counter!("cache_requests_total", &labels).increment(1);
}

/// 记录一次写入，`mode` 为 local / sync / async
pub fn record_write(cache: &str, mode: &'static str) {
    let labels = [("cache", cache.to_string()), ("mode", mode.to_string())];

    counter!("cache_writes_total", &labels).increment(1);
}

/// 记录同步事件，`direction` 为 published / received / dropped
pub fn record_sync_event(cache: &str, direction: &'static str, event_type: &'static str) {
    let labels = [
        ("cache", cache.to_string()),
        ("direction", direction.to_string()),
        ("type", event_type.to_string()),
    ];

    counter!("cache_sync_events_total", &labels).increment(1);
}

/// 记录断路器状态切换
pub fn record_circuit_transition(cache: &str, state: &'static str) {
    let labels = [("cache", cache.to_string()), ("state", state.to_string())];

    counter!("cache_circuit_transitions_total", &labels).increment(1);
}

/// 记录被布隆过滤器拦截的请求
pub fn record_penetration_blocked(cache: &str) {
    counter!("cache_penetration_blocked_total", "cache" => cache.to_string()).increment(1);
}

/// 更新本地层条目数
pub fn set_local_entries(cache: &str, entries: usize) {
    gauge!("cache_local_entries", "cache" => cache.to_string()).set(entries as f64);
}
