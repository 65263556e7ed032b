//! Injected metrics sink.
//!
//! The core never owns process-wide metric globals; everything observable
//! (queue pressure, failure counts, running times) flows through a
//! [`MetricsSink`] handed in at construction time, so tests can swap in
//! [`RecordingSink`] and assert on emitted values.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Observable process-wide signals emitted by the gateway.
pub trait MetricsSink: Send + Sync {
    /// Current queue backlog and its ratio against the configured maximum.
    fn set_queue_size(&self, size: usize, ratio: f64);
    /// One asynchronous prediction ended in `failed`.
    fn incr_predict_failures(&self);
    /// Backend-reported running time of the latest successful prediction.
    fn observe_running_time(&self, seconds: f64);
    /// Number of tasks the stale-status sweep forced to `failed`.
    fn set_tasks_forced_failed(&self, count: usize);
}

/// Default sink: emits every observation as a structured trace event.
/// Metrics export proper is the host's concern, not the core's.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn set_queue_size(&self, size: usize, ratio: f64) {
        tracing::debug!(queue_size = size, queue_size_ratio = ratio, "queue size");
    }

    fn incr_predict_failures(&self) {
        tracing::debug!("async prediction failed");
    }

    fn observe_running_time(&self, seconds: f64) {
        tracing::debug!(running_time_secs = seconds, "prediction running time");
    }

    fn set_tasks_forced_failed(&self, count: usize) {
        tracing::debug!(forced_failed = count, "stale tasks forced to failed");
    }
}

/// In-memory sink capturing the latest values, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub queue_size: AtomicUsize,
    pub predict_failures: AtomicUsize,
    pub forced_failed: AtomicUsize,
    /// Running times in microseconds, in observation order.
    running_times_us: Mutex<Vec<u64>>,
    last_ratio_millis: AtomicU64,
}

impl RecordingSink {
    pub fn running_times(&self) -> Vec<f64> {
        self.running_times_us
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .map(|us| *us as f64 / 1e6)
            .collect()
    }

    pub fn last_ratio(&self) -> f64 {
        self.last_ratio_millis.load(Ordering::Relaxed) as f64 / 1e3
    }
}

impl MetricsSink for RecordingSink {
    fn set_queue_size(&self, size: usize, ratio: f64) {
        self.queue_size.store(size, Ordering::Relaxed);
        self.last_ratio_millis
            .store((ratio * 1e3) as u64, Ordering::Relaxed);
    }

    fn incr_predict_failures(&self) {
        self.predict_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_running_time(&self, seconds: f64) {
        self.running_times_us
            .lock()
            .expect("metrics mutex poisoned")
            .push((seconds * 1e6) as u64);
    }

    fn set_tasks_forced_failed(&self, count: usize) {
        self.forced_failed.store(count, Ordering::Relaxed);
    }
}
