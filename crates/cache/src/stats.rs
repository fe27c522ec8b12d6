//! 缓存统计

use std::sync::atomic::{AtomicU64, Ordering};

/// 多级缓存的运行统计
#[derive(Debug, Default)]
pub struct CacheStats {
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    remote_hits: AtomicU64,
    remote_misses: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub remote_hits: u64,
    pub remote_misses: u64,
    /// 所有层都未命中
    pub misses: u64,
    pub loads: u64,
    pub writes: u64,
    pub removals: u64,
}

impl CacheStatsSnapshot {
    /// 任意一层命中的比例
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.remote_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl CacheStats {
    pub(crate) fn local(&self, hit: bool) {
        if hit {
            self.local_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.local_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn remote(&self, hit: bool) {
        if hit {
            self.remote_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.remote_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            local_misses: self.local_misses.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            remote_misses: self.remote_misses.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::default();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);

        stats.local(true);
        stats.local(false);
        stats.remote(true);
        stats.local(false);
        stats.remote(false);
        stats.miss();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.local_hits, 1);
        assert_eq!(snapshot.local_misses, 2);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
