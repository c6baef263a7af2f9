//! Metrics tracking for page-store operations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a resource's read and write paths.
#[derive(Default)]
pub struct StoreMetrics {
    pages_read: AtomicU64,
    cache_hits: AtomicU64,
    leaf_reconstructions: AtomicU64,
    pages_written: AtomicU64,
    commits: AtomicU64,
    intermediate_commits: AtomicU64,
}

/// Snapshot of store metrics at a point in time.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMetricsSnapshot {
    /// Page frames decoded from the backend.
    pub pages_read: u64,
    /// Page lookups served by the shared cache.
    pub cache_hits: u64,
    /// Logical leaves combined from fragment chains.
    pub leaf_reconstructions: u64,
    /// Page frames appended by commits.
    pub pages_written: u64,
    /// Durable commits, the bootstrap included.
    pub commits: u64,
    /// Intent-log rotations handed to the background committer.
    pub intermediate_commits: u64,
}

impl StoreMetricsSnapshot {
    /// Share of page lookups served without touching the backend.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.pages_read + self.cache_hits;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }
}

impl StoreMetrics {
    /// Creates a snapshot of the current metrics.
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            pages_read: self.pages_read.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            leaf_reconstructions: self.leaf_reconstructions.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            intermediate_commits: self.intermediate_commits.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_page_read(&self) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_leaf_reconstruction(&self) {
        self.leaf_reconstructions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_pages_written(&self, delta: u64) {
        if delta != 0 {
            self.pages_written.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_intermediate_commit(&self) {
        self.intermediate_commits.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = StoreMetrics::default();
        metrics.add_page_read();
        metrics.add_cache_hit();
        metrics.add_cache_hit();
        metrics.add_pages_written(5);
        metrics.add_commit();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_read, 1);
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.pages_written, 5);
        assert_eq!(snapshot.commits, 1);
        assert!(snapshot.cache_hit_ratio() > 0.6);
    }

    #[test]
    fn hit_ratio_handles_empty_counters() {
        let metrics = StoreMetrics::default();
        assert_eq!(metrics.snapshot().cache_hit_ratio(), 0.0);
    }
}
