//! Fixity engine metrics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::record::FixityState;

/// Counters for checks, queue traffic and daemon ticks
#[derive(Debug)]
pub struct FixityMetrics {
    /// Time when the daemon started
    start_time: RwLock<Option<Instant>>,

    /// Checks performed
    checks_performed: AtomicU64,

    /// Checks that matched
    checks_passed: AtomicU64,

    /// Checks with any other outcome
    checks_failed: AtomicU64,

    /// Checks skipped because the last one is still current
    checks_skipped: AtomicU64,

    /// Checks that raised an error
    check_errors: AtomicU64,

    /// Records deleted because their object disappeared
    records_removed: AtomicU64,

    /// Objects enrolled in periodic checks
    objects_enrolled: AtomicU64,

    /// Records admitted to the work queue
    items_admitted: AtomicU64,

    /// Stale queue markers reclaimed
    markers_reclaimed: AtomicU64,

    /// Daemon ticks completed
    ticks: AtomicU64,

    /// Total check time (microseconds)
    check_time_us: AtomicU64,
}

impl FixityMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            checks_performed: AtomicU64::new(0),
            checks_passed: AtomicU64::new(0),
            checks_failed: AtomicU64::new(0),
            checks_skipped: AtomicU64::new(0),
            check_errors: AtomicU64::new(0),
            records_removed: AtomicU64::new(0),
            objects_enrolled: AtomicU64::new(0),
            items_admitted: AtomicU64::new(0),
            markers_reclaimed: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            check_time_us: AtomicU64::new(0),
        }
    }

    /// Record daemon start
    pub fn record_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Record daemon stop
    pub fn record_stop(&self) {
        *self.start_time.write() = None;
    }

    /// Record a completed check
    pub fn record_check(&self, state: FixityState, duration: Duration) {
        self.checks_performed.fetch_add(1, Ordering::Relaxed);
        if state.passed() {
            self.checks_passed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.check_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a skipped check
    pub fn record_skip(&self) {
        self.checks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a check that raised an error
    pub fn record_error(&self) {
        self.check_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record deleted with its object
    pub fn record_removed(&self) {
        self.records_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record objects enrolled in periodic checks
    pub fn record_enrolled(&self, count: u64) {
        self.objects_enrolled.fetch_add(count, Ordering::Relaxed);
    }

    /// Record queue admissions
    pub fn record_admitted(&self, count: u64) {
        self.items_admitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record reclaimed queue markers
    pub fn record_reclaimed(&self, count: u64) {
        self.markers_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a finished daemon tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.read().as_ref().map(|t: &Instant| t.elapsed())
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().map(|d| d.as_secs()).unwrap_or(0),
            checks_performed: self.checks_performed.load(Ordering::Relaxed),
            checks_passed: self.checks_passed.load(Ordering::Relaxed),
            checks_failed: self.checks_failed.load(Ordering::Relaxed),
            checks_skipped: self.checks_skipped.load(Ordering::Relaxed),
            check_errors: self.check_errors.load(Ordering::Relaxed),
            records_removed: self.records_removed.load(Ordering::Relaxed),
            objects_enrolled: self.objects_enrolled.load(Ordering::Relaxed),
            items_admitted: self.items_admitted.load(Ordering::Relaxed),
            markers_reclaimed: self.markers_reclaimed.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            avg_check_time_ms: self.avg_check_time_ms(),
        }
    }

    /// Calculate average check time in milliseconds
    fn avg_check_time_ms(&self) -> f64 {
        let total = self.checks_performed.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let total_us = self.check_time_us.load(Ordering::Relaxed);
        (total_us as f64 / total as f64) / 1000.0
    }
}

impl Default for FixityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`FixityMetrics`]
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Uptime in seconds
    pub uptime_secs: u64,

    /// Checks performed
    pub checks_performed: u64,

    /// Checks that matched
    pub checks_passed: u64,

    /// Checks with any other outcome
    pub checks_failed: u64,

    /// Checks skipped
    pub checks_skipped: u64,

    /// Checks that raised an error
    pub check_errors: u64,

    /// Records deleted with their object
    pub records_removed: u64,

    /// Objects enrolled in periodic checks
    pub objects_enrolled: u64,

    /// Records admitted to the work queue
    pub items_admitted: u64,

    /// Stale queue markers reclaimed
    pub markers_reclaimed: u64,

    /// Daemon ticks completed
    pub ticks: u64,

    /// Average check time in milliseconds
    pub avg_check_time_ms: f64,
}

impl MetricsSnapshot {
    /// Share of performed checks that did not match, in percent
    pub fn failure_rate(&self) -> f64 {
        if self.checks_performed == 0 {
            return 0.0;
        }
        self.checks_failed as f64 / self.checks_performed as f64 * 100.0
    }

    /// Format as human-readable string
    pub fn summary(&self) -> String {
        format!(
            "Fixity Metrics:\n\
             - Uptime: {}s, ticks: {}\n\
             - Checks: {} performed ({} passed, {} failed), {} skipped, {} errors\n\
             - Queue: {} admitted, {} reclaimed\n\
             - Enrolled: {}, removed: {}\n\
             - Avg check time: {:.1}ms\n\
             - Failure rate: {:.2}%",
            self.uptime_secs,
            self.ticks,
            self.checks_performed,
            self.checks_passed,
            self.checks_failed,
            self.checks_skipped,
            self.check_errors,
            self.items_admitted,
            self.markers_reclaimed,
            self.objects_enrolled,
            self.records_removed,
            self.avg_check_time_ms,
            self.failure_rate(),
        )
    }
}
