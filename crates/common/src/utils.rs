//! 通用工具函数

use std::time::Duration;

use uuid::Uuid;

/// 生成新的 UUID v4（随机），用作进程实例标识
pub fn random_id() -> Uuid {
    Uuid::new_v4()
}

/// 当前时间（Unix 毫秒）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 计算过期时间点（Unix 毫秒），`None` 或零时长表示永不过期，返回 0
pub fn expire_at_millis(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) if !ttl.is_zero() => {
            now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        }
        _ => 0,
    }
}
