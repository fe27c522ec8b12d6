//! 健康检查结果
//!
//! 远程存储和同步订阅各是一个组件。远程层不可用时本地层仍能服务，
//! 所以部分组件失败记为降级而不是整体不可用

use serde::{Deserialize, Serialize};

/// 单个探测的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseHealthResult {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl BaseHealthResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    /// 探测在超时内没有返回
    pub fn timeout() -> Self {
        Self::unhealthy("Health check timed out")
    }
}

/// 整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// 部分组件失败
    Degraded,
    /// 所有组件都失败
    Unhealthy,
}

/// 组件健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
    pub result: BaseHealthResult,
}

/// 聚合多个组件的健康状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatedHealthResult {
    /// 所有组件都健康（没有组件时也为 true）
    pub healthy: bool,
    pub components: Vec<ComponentHealth>,
}

impl AggregatedHealthResult {
    pub fn new() -> Self {
        Self {
            healthy: true,
            components: Vec::new(),
        }
    }

    pub fn add_component(&mut self, name: impl Into<String>, result: BaseHealthResult) {
        self.healthy &= result.healthy;
        self.components.push(ComponentHealth {
            name: name.into(),
            result,
        });
    }

    pub fn healthy_count(&self) -> usize {
        self.components.iter().filter(|c| c.result.healthy).count()
    }

    pub fn total_count(&self) -> usize {
        self.components.len()
    }

    pub fn status(&self) -> HealthStatus {
        match self.healthy_count() {
            n if n == self.total_count() => HealthStatus::Healthy,
            0 => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        }
    }

    /// 失败组件的名称
    pub fn failed_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| !c.result.healthy)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_unhealthy() {
        let timeout = BaseHealthResult::timeout();
        assert!(!timeout.healthy);
        assert!(timeout.latency_ms.is_none());
        assert!(timeout.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_status_transitions() {
        let mut result = AggregatedHealthResult::new();
        assert_eq!(result.status(), HealthStatus::Healthy);

        result.add_component("remote:redis", BaseHealthResult::healthy(3));
        result.add_component("sync", BaseHealthResult::healthy(0));
        assert!(result.healthy);
        assert_eq!(result.status(), HealthStatus::Healthy);

        result.add_component("remote:backup", BaseHealthResult::unhealthy("connection refused"));
        assert!(!result.healthy);
        assert_eq!(result.status(), HealthStatus::Degraded);
        assert_eq!(result.failed_components(), vec!["remote:backup"]);
        assert_eq!(result.healthy_count(), 2);
        assert_eq!(result.total_count(), 3);
    }

    #[test]
    fn test_all_failed_is_unhealthy() {
        let mut result = AggregatedHealthResult::new();
        result.add_component("remote:redis", BaseHealthResult::timeout());
        result.add_component("sync", BaseHealthResult::unhealthy("Sync subscription is not active"));
        assert_eq!(result.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serializes_flat_components() {
        let mut result = AggregatedHealthResult::new();
        result.add_component("sync", BaseHealthResult::healthy(1));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["components"][0]["name"], "sync");
        assert_eq!(json["components"][0]["latency_ms"], 1);
    }
}
