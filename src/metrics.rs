//! Timing of message handling.
//!
//! Recording is best effort: a [`MetricsSink`] may fail, and the caller logs
//! and ignores the failure.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::error::Result;

/// Operation name under which frame handling is recorded.
pub const HANDLE_MESSAGE: &str = "handle-message";

pub trait MetricsSink: Send + Sync {
    /// Records that `operation` took `elapsed`.
    fn record(&self, operation: &'static str, elapsed: Duration) -> Result<()>;
}

/// A sink that drops every sample.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn record(&self, _operation: &'static str, _elapsed: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Bucket {
    count: u64,
    total: Duration,
    max: Duration,
}

/// Aggregate of the samples of one operation since the last snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingSnapshot {
    pub operation: &'static str,
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimingSnapshot {
    #[must_use]
    pub fn average(&self) -> Duration {
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        self.total.checked_div(count).unwrap_or_default()
    }
}

impl fmt::Display for TimingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} count={} avg={:.2}ms max={:.2}ms",
            self.operation,
            self.count,
            self.average().as_secs_f64() * 1000.0,
            self.max.as_secs_f64() * 1000.0,
        )
    }
}

/// In-memory timing buckets, keyed by operation.
#[derive(Debug, Default)]
pub struct Timings {
    enabled: AtomicBool,
    buckets: Mutex<BTreeMap<&'static str, Bucket>>,
}

impl Timings {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            buckets: Mutex::default(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns recording on or off. Turning it off discards collected samples.
    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.enabled.swap(enabled, Ordering::Relaxed);
        if was_enabled && !enabled {
            if let Ok(mut buckets) = self.buckets.lock() {
                buckets.clear();
            }
        }
    }

    /// Takes the aggregates collected so far and starts over.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a recording thread panicked while holding the
    /// buckets.
    pub fn snapshot_and_reset(&self) -> Result<Vec<TimingSnapshot>> {
        let buckets = std::mem::take(&mut *self.buckets.lock()?);
        Ok(buckets
            .into_iter()
            .map(|(operation, bucket)| TimingSnapshot {
                operation,
                count: bucket.count,
                total: bucket.total,
                max: bucket.max,
            })
            .collect())
    }
}

impl MetricsSink for Timings {
    fn record(&self, operation: &'static str, elapsed: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut buckets = self.buckets.lock()?;
        let bucket = buckets.entry(operation).or_default();
        bucket.count += 1;
        bucket.total += elapsed;
        bucket.max = bucket.max.max(elapsed);
        Ok(())
    }
}
