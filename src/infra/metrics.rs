//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Device channel and lifecycle counters
pub struct Metrics {
    /// Publish packets received on any device topic (monotonic)
    messages_total: AtomicU64,
    /// Messages since last report (reset on report)
    messages_since_report: AtomicU64,
    /// Data messages decoded into readings (monotonic)
    readings_total: AtomicU64,
    /// Status messages decoded (monotonic)
    status_total: AtomicU64,
    /// Payloads that failed strict decoding (monotonic)
    malformed_dropped: AtomicU64,
    /// Events dropped because the consumer queue was full (monotonic)
    queue_full_dropped: AtomicU64,
    /// Commands handed to the broker (monotonic)
    publishes_total: AtomicU64,
    /// Commands refused or failed (monotonic)
    publish_failures: AtomicU64,
    /// Connection losses followed by a reconnect attempt (monotonic)
    reconnects_total: AtomicU64,
    /// Samples rejected by the telemetry store (monotonic)
    samples_rejected: AtomicU64,
    /// Stage transitions confirmed by the remote service (monotonic)
    transitions_total: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_total: AtomicU64::new(0),
            messages_since_report: AtomicU64::new(0),
            readings_total: AtomicU64::new(0),
            status_total: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            queue_full_dropped: AtomicU64::new(0),
            publishes_total: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_message_received(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.messages_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reading(&self) {
        self.readings_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_status(&self) {
        self.status_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_queue_full(&self) {
        self.queue_full_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish(&self) {
        self.publishes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sample_rejected(&self) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transition(&self) {
        self.transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_total(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }

    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped.load(Ordering::Relaxed)
    }

    pub fn queue_full_dropped(&self) -> u64 {
        self.queue_full_dropped.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn reconnects_total(&self) -> u64 {
        self.reconnects_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let messages_count = self.messages_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let messages_per_sec = if elapsed.as_secs_f64() > 0.0 {
            messages_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            messages_total: self.messages_total.load(Ordering::Relaxed),
            messages_per_sec,
            readings_total: self.readings_total.load(Ordering::Relaxed),
            status_total: self.status_total.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            queue_full_dropped: self.queue_full_dropped.load(Ordering::Relaxed),
            publishes_total: self.publishes_total.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub messages_total: u64,
    pub messages_per_sec: f64,
    pub readings_total: u64,
    pub status_total: u64,
    /// Payloads dropped by strict decoding
    pub malformed_dropped: u64,
    /// Events dropped due to channel full
    pub queue_full_dropped: u64,
    pub publishes_total: u64,
    pub publish_failures: u64,
    pub reconnects_total: u64,
    pub samples_rejected: u64,
    pub transitions_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            messages_total = %self.messages_total,
            messages_per_sec = format!("{:.1}", self.messages_per_sec),
            readings = %self.readings_total,
            status = %self.status_total,
            malformed = %self.malformed_dropped,
            queue_full = %self.queue_full_dropped,
            publishes = %self.publishes_total,
            publish_failures = %self.publish_failures,
            reconnects = %self.reconnects_total,
            samples_rejected = %self.samples_rejected,
            transitions = %self.transitions_total,
            "metrics"
        );
    }
}
