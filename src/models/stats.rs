//! Pool statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of a pool's state. All zero means the stats are unavailable
/// (for example after the pool was closed), not that the pool is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquired_conns: u32,
    pub idle_conns: u32,
    pub max_conns: u32,
    pub total_conns: u32,
    pub acquire_count: u64,
    /// Cumulative time spent waiting in acquire.
    pub acquire_duration: Duration,
    pub canceled_acquire_count: u64,
    pub constructing_conns: u32,
    /// Acquires that found no idle connection and had to wait or create one.
    pub empty_acquire_count: u64,
}

impl PoolStats {
    pub fn is_unavailable(&self) -> bool {
        *self == Self::default()
    }
}

/// Acquire counters kept by the adapters, since the native pools do not
/// expose them uniformly.
#[derive(Debug, Default)]
pub struct AcquireMetrics {
    count: AtomicU64,
    duration_nanos: AtomicU64,
    canceled: AtomicU64,
    empty: AtomicU64,
}

impl AcquireMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful acquire that started at `started`.
    pub fn record(&self, started: Instant, was_empty: bool) {
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.duration_nanos.fetch_add(nanos, Ordering::Relaxed);
        if was_empty {
            self.empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an acquire abandoned because the caller's context ended.
    pub fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into `stats`.
    pub fn fill(&self, stats: &mut PoolStats) {
        stats.acquire_count = self.count.load(Ordering::Relaxed);
        stats.acquire_duration = Duration::from_nanos(self.duration_nanos.load(Ordering::Relaxed));
        stats.canceled_acquire_count = self.canceled.load(Ordering::Relaxed);
        stats.empty_acquire_count = self.empty.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stats_unavailable() {
        assert!(PoolStats::default().is_unavailable());
        let stats = PoolStats {
            max_conns: 1,
            ..PoolStats::default()
        };
        assert!(!stats.is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_metrics() {
        let metrics = AcquireMetrics::new();
        let started = Instant::now();
        tokio::time::advance(Duration::from_millis(20)).await;
        metrics.record(started, true);
        metrics.record(Instant::now(), false);
        metrics.record_canceled();

        let mut stats = PoolStats::default();
        metrics.fill(&mut stats);
        assert_eq!(stats.acquire_count, 2);
        assert_eq!(stats.empty_acquire_count, 1);
        assert_eq!(stats.canceled_acquire_count, 1);
        assert_eq!(stats.acquire_duration, Duration::from_millis(20));
    }
}
