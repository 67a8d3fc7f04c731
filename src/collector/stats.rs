use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::metrics::Metrics;

/// Lock-free collector counters.
///
/// Counters are monotonic for the life of the collector. When a metrics
/// registry is attached every update is mirrored into it.
pub struct CollectorStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    write_failed: AtomicU64,
    committed: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

/// Point-in-time copy of the collector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub write_failed: u64,
    pub committed: u64,
}

impl CollectorStats {
    pub fn new(metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            write_failed: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn record_accepted(&self, n: u64) {
        self.accepted.fetch_add(n, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.events_accepted.inc_by(n as f64);
        }
    }

    pub fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.events_dropped.inc_by(n as f64);
        }
    }

    pub fn record_rejected(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.rejected.fetch_add(n, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.events_rejected.inc_by(n as f64);
        }
    }

    /// Counts a submission refused as a whole. Only the metric tracks these;
    /// the caller already received the error.
    pub fn record_batch_rejected(&self, kind: &str) {
        if let Some(m) = &self.metrics {
            m.batches_rejected.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_write_failed(&self, n: u64) {
        self.write_failed.fetch_add(n, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.events_write_failed.inc_by(n as f64);
        }
    }

    pub fn record_committed(&self, n: u64, elapsed: Duration) {
        self.committed.fetch_add(n, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.events_committed.inc_by(n as f64);
            m.batches_committed.inc();
            m.flush_duration.observe(elapsed.as_secs_f64());
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(m) = &self.metrics {
            m.queue_depth.set(depth as f64);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn write_failed(&self) -> u64 {
        self.write_failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            write_failed: self.write_failed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
        }
    }
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new(None)
    }
}
