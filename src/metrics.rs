// Runtime metrics module
//
// Lock-free counters for scans, cache use and binary downloads

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters
///
/// Uses atomic operations for thread-safe metric tracking without locks.
/// Shared as `Arc<Metrics>` by the workspace context, the cache and the
/// file watcher, and logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Scans whose outcome was a success
    pub scans_succeeded: AtomicUsize,

    /// Scans that ended in a structured or unstructured error
    pub scans_failed: AtomicUsize,

    /// Scans cancelled before producing a result
    pub scans_cancelled: AtomicUsize,

    /// Total scanner wall time in milliseconds
    pub total_scan_time_ms: AtomicU64,

    /// Fresh cache entries served
    pub cache_hits: AtomicU64,

    /// Lookups that found nothing fresh
    pub cache_misses: AtomicU64,

    /// Category invalidations applied by the file watcher
    pub invalidations: AtomicU64,

    pub downloads_succeeded: AtomicUsize,
    pub downloads_failed: AtomicUsize,

    /// Number of state change events broadcast
    pub state_broadcasts: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans_succeeded: AtomicUsize::new(0),
            scans_failed: AtomicUsize::new(0),
            scans_cancelled: AtomicUsize::new(0),
            total_scan_time_ms: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            downloads_succeeded: AtomicUsize::new(0),
            downloads_failed: AtomicUsize::new(0),
            state_broadcasts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished scan by how it ended
    pub fn record_scan(&self, succeeded: bool, cancelled: bool, duration: Duration) {
        let counter = if cancelled {
            &self.scans_cancelled
        } else if succeeded {
            &self.scans_succeeded
        } else {
            &self.scans_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_scan_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, succeeded: bool) {
        if succeeded {
            self.downloads_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.downloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_state_broadcast(&self) {
        self.state_broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn scans_total(&self) -> usize {
        self.scans_succeeded.load(Ordering::Relaxed)
            + self.scans_failed.load(Ordering::Relaxed)
            + self.scans_cancelled.load(Ordering::Relaxed)
    }

    /// Average scanner wall time per scan in milliseconds
    pub fn avg_scan_time_ms(&self) -> f64 {
        let total = self.total_scan_time_ms.load(Ordering::Relaxed);
        let count = self.scans_total();
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Fraction of lookups served from the cache
    pub fn cache_hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Scans: {} succeeded, {} failed, {} cancelled (avg: {:.2}ms)",
            self.scans_succeeded.load(Ordering::Relaxed),
            self.scans_failed.load(Ordering::Relaxed),
            self.scans_cancelled.load(Ordering::Relaxed),
            self.avg_scan_time_ms()
        );
        tracing::info!(
            "Cache: {} hits, {} misses ({:.0}% hit ratio), {} invalidations",
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.cache_hit_ratio() * 100.0,
            self.invalidations.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Downloads: {} succeeded, {} failed; state broadcasts: {}",
            self.downloads_succeeded.load(Ordering::Relaxed),
            self.downloads_failed.load(Ordering::Relaxed),
            self.state_broadcasts.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
