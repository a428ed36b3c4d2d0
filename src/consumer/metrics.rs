//! Consumer metrics collection

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handler duration samples kept for percentile stats
const DURATION_WINDOW: usize = 1000;

/// Consumer metrics collector
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    fetched: Arc<AtomicU64>,
    processed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    malformed: Arc<AtomicU64>,
    acknowledged: Arc<AtomicU64>,
    ack_failures: Arc<AtomicU64>,
    fetch_errors: Arc<AtomicU64>,
    empty_polls: Arc<AtomicU64>,
    handler_durations: Arc<RwLock<VecDeque<Duration>>>,
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub fetched: u64,
    pub processed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
    pub fetch_errors: u64,
    pub empty_polls: u64,
    pub uptime_secs: u64,
}

/// Handler latency percentiles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingStats {
    pub count: usize,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub mean: Duration,
}

impl ConsumerMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            fetched: Arc::new(AtomicU64::new(0)),
            processed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            malformed: Arc::new(AtomicU64::new(0)),
            acknowledged: Arc::new(AtomicU64::new(0)),
            ack_failures: Arc::new(AtomicU64::new(0)),
            fetch_errors: Arc::new(AtomicU64::new(0)),
            empty_polls: Arc::new(AtomicU64::new(0)),
            handler_durations: Arc::new(RwLock::new(VecDeque::with_capacity(DURATION_WINDOW))),
            start_time: Instant::now(),
        }
    }

    /// Record entries returned by a fetch
    pub fn add_fetched(&self, count: usize) {
        self.fetched.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Count an entry the handler accepted
    pub fn increment_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an entry the handler rejected
    pub fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an entry missing required fields
    pub fn increment_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a successful acknowledgment
    pub fn increment_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed acknowledgment
    pub fn increment_ack_failures(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed fetch
    pub fn increment_fetch_errors(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a fetch that timed out empty
    pub fn increment_empty_polls(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Record handler duration
    pub fn record_handler_duration(&self, duration: Duration) {
        let mut durations = self.handler_durations.write();
        if durations.len() == DURATION_WINDOW {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    /// Copy all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Get handler latency statistics
    pub fn processing_stats(&self) -> ProcessingStats {
        let durations = self.handler_durations.read();
        if durations.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<Duration> = durations.iter().copied().collect();
        sorted.sort();

        let p50_idx = sorted.len() / 2;
        let p95_idx = ((sorted.len() - 1) as f64 * 0.95) as usize;
        let p99_idx = ((sorted.len() - 1) as f64 * 0.99) as usize;

        ProcessingStats {
            count: sorted.len(),
            p50: sorted[p50_idx],
            p95: sorted[p95_idx],
            p99: sorted[p99_idx],
            mean: sorted.iter().sum::<Duration>() / sorted.len() as u32,
        }
    }

    /// Fraction of handled entries that succeeded
    pub fn success_rate(&self) -> f64 {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = processed + failed;

        if total > 0 {
            processed as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
