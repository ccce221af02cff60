//! Aggregation of upload results into run statistics.
//!
//! Latencies of successful uploads are tracked in a [`DDSketch`] with the default configuration:
//! a relative accuracy of 1% (`alpha = 0.01`) and at most 2048 bins. Every reported percentile is
//! therefore within 1% of the latency of an upload at that rank, independent of the number of
//! uploads. The maximum latency is tracked exactly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sketches_ddsketch::DDSketch;
use tokio::time::Instant;

use crate::upload::{ErrorKind, UploadResult};

/// Relative accuracy of the latency percentiles in a [`RunSnapshot`].
pub const LATENCY_RELATIVE_ACCURACY: f64 = 0.01;

/// Latency distribution of the successful uploads in a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyPercentiles {
    /// Median latency.
    pub p50: Duration,
    /// 90th percentile.
    pub p90: Duration,
    /// 99th percentile.
    pub p99: Duration,
    /// Slowest upload, exact.
    pub max: Duration,
    /// Mean latency.
    pub mean: Duration,
}

/// A point-in-time summary of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSnapshot {
    /// Number of objects the run was configured to upload.
    pub planned: u64,
    /// Number of uploads that were dispatched and produced a result.
    pub total_attempted: u64,
    /// Number of objects written.
    pub total_succeeded: u64,
    /// Number of uploads that failed, including cancelled ones.
    pub total_failed: u64,
    /// Bytes written by successful uploads.
    pub total_bytes: u64,
    /// Time from the first dispatch until the last completion.
    pub elapsed: Duration,
    /// Latency distribution of successful uploads, `None` if nothing succeeded.
    pub latency: Option<LatencyPercentiles>,
    /// Failed uploads per kind.
    pub failures: BTreeMap<ErrorKind, u64>,
    /// Whether the run was cancelled before all objects were dispatched.
    pub cancelled: bool,
}

impl RunSnapshot {
    /// Aggregate throughput in bytes per second.
    pub fn throughput(&self) -> f64 {
        per_second(self.total_bytes, self.elapsed)
    }

    /// Successful uploads per second.
    pub fn ops_per_second(&self) -> f64 {
        per_second(self.total_succeeded, self.elapsed)
    }

    /// Share of failed uploads among all attempted ones, in percent.
    pub fn failure_percentage(&self) -> f64 {
        if self.total_attempted == 0 {
            return 0.0;
        }
        self.total_failed as f64 * 100.0 / self.total_attempted as f64
    }
}

fn per_second(total: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { total as f64 / secs } else { 0.0 }
}

#[derive(Default)]
struct Inner {
    attempted: u64,
    succeeded: u64,
    failed: u64,
    bytes: u64,
    latency: DDSketch,
    max_latency: Duration,
    failures: BTreeMap<ErrorKind, u64>,
    first_dispatch: Option<Instant>,
    last_completion: Option<Instant>,
    cancelled: bool,
}

impl Inner {
    fn elapsed(&self) -> Duration {
        match (self.first_dispatch, self.last_completion) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    fn percentiles(&self) -> Option<LatencyPercentiles> {
        let count = self.latency.count();
        if count == 0 {
            return None;
        }

        let quantile = |q| {
            let secs = self.latency.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs.max(0.0))
        };
        let sum = self.latency.sum().unwrap_or_default();

        Some(LatencyPercentiles {
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            max: self.max_latency,
            mean: Duration::from_secs_f64((sum / count as f64).max(0.0)),
        })
    }

    fn snapshot(&self, planned: u64) -> RunSnapshot {
        RunSnapshot {
            planned,
            total_attempted: self.attempted,
            total_succeeded: self.succeeded,
            total_failed: self.failed,
            total_bytes: self.bytes,
            elapsed: self.elapsed(),
            latency: self.percentiles(),
            failures: self.failures.clone(),
            cancelled: self.cancelled,
        }
    }
}

/// Collects [`UploadResult`]s from concurrent workers.
///
/// Recording holds a lock only for constant-time bookkeeping. The final [`RunSnapshot`] is
/// produced by [`finalize`](Self::finalize), which consumes the aggregator.
pub struct MetricsAggregator {
    planned: u64,
    inner: Mutex<Inner>,
}

impl fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MetricsAggregator")
            .field("planned", &self.planned)
            .field("attempted", &inner.attempted)
            .field("succeeded", &inner.succeeded)
            .field("failed", &inner.failed)
            .finish_non_exhaustive()
    }
}

impl MetricsAggregator {
    /// Creates an aggregator for a run of `planned` objects.
    pub fn new(planned: u64) -> Self {
        Self {
            planned,
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Notes that an upload was dispatched.
    ///
    /// The first call starts the clock for the elapsed time of the run.
    pub fn mark_dispatched(&self) {
        let now = Instant::now();
        self.lock().first_dispatch.get_or_insert(now);
    }

    /// Notes that the run was cancelled.
    pub fn mark_cancelled(&self) {
        self.lock().cancelled = true;
    }

    /// Records the outcome of one upload.
    pub fn record(&self, result: UploadResult) {
        let now = Instant::now();
        let mut inner = self.lock();

        inner.attempted += 1;
        match result.error_kind {
            None => {
                inner.succeeded += 1;
                inner.bytes += result.bytes_sent;
                inner.latency.add(result.latency.as_secs_f64());
                inner.max_latency = inner.max_latency.max(result.latency);
            }
            Some(kind) => {
                inner.failed += 1;
                *inner.failures.entry(kind).or_default() += 1;
            }
        }

        if inner.last_completion.is_none_or(|last| last < now) {
            inner.last_completion = Some(now);
        }
    }

    /// Returns the statistics recorded so far.
    pub fn snapshot(&self) -> RunSnapshot {
        self.lock().snapshot(self.planned)
    }

    /// Freezes the statistics of the completed run.
    pub fn finalize(self) -> RunSnapshot {
        let inner = self
            .inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.snapshot(self.planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        // one rank of slack on top of the sketch accuracy
        let tolerance = expected.mul_f64(LATENCY_RELATIVE_ACCURACY) + ms(1);
        let diff = actual.abs_diff(expected);
        assert!(
            diff <= tolerance,
            "{actual:?} is not within {tolerance:?} of {expected:?}"
        );
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = MetricsAggregator::new(0).finalize();

        assert_eq!(snapshot, RunSnapshot::default());
        assert_eq!(snapshot.throughput(), 0.0);
        assert_eq!(snapshot.failure_percentage(), 0.0);
    }

    #[test]
    fn counts_outcomes() {
        let metrics = MetricsAggregator::new(5);
        metrics.mark_dispatched();
        metrics.record(UploadResult::succeeded(0, 100, ms(5)));
        metrics.record(UploadResult::succeeded(1, 100, ms(7)));
        metrics.record(UploadResult::failed(2, ErrorKind::NetworkError, ms(1)));
        metrics.record(UploadResult::failed(3, ErrorKind::AuthError, ms(1)));
        metrics.record(UploadResult::failed(4, ErrorKind::NetworkError, ms(1)));

        let snapshot = metrics.finalize();
        assert_eq!(snapshot.planned, 5);
        assert_eq!(snapshot.total_attempted, 5);
        assert_eq!(snapshot.total_succeeded, 2);
        assert_eq!(snapshot.total_failed, 3);
        assert_eq!(snapshot.total_bytes, 200);
        assert_eq!(
            snapshot.failures,
            BTreeMap::from([(ErrorKind::NetworkError, 2), (ErrorKind::AuthError, 1)])
        );
        assert_eq!(snapshot.failure_percentage(), 60.0);

        let latency = snapshot.latency.unwrap();
        assert_eq!(latency.max, ms(7));
    }

    #[test]
    fn percentiles_within_tolerance() {
        let metrics = MetricsAggregator::new(1000);
        for i in 1..=1000 {
            metrics.record(UploadResult::succeeded(i, 1, ms(i)));
        }

        let latency = metrics.finalize().latency.unwrap();
        assert_close(latency.p50, ms(500));
        assert_close(latency.p90, ms(900));
        assert_close(latency.p99, ms(990));
        assert_close(latency.mean, Duration::from_micros(500_500));
        assert_eq!(latency.max, ms(1000));
    }

    #[test]
    fn failures_have_no_latency() {
        let metrics = MetricsAggregator::new(2);
        metrics.record(UploadResult::failed(0, ErrorKind::ServerError, ms(3)));
        metrics.record(UploadResult::failed(1, ErrorKind::ServerError, ms(3)));

        let snapshot = metrics.finalize();
        assert_eq!(snapshot.latency, None);
        assert_eq!(snapshot.total_bytes, 0);
        assert_eq!(snapshot.failure_percentage(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_spans_first_dispatch_to_last_completion() {
        let metrics = MetricsAggregator::new(2);
        metrics.mark_dispatched();
        tokio::time::sleep(ms(100)).await;
        metrics.mark_dispatched();
        metrics.record(UploadResult::succeeded(0, 1000, ms(100)));
        tokio::time::sleep(ms(400)).await;
        metrics.record(UploadResult::succeeded(1, 1000, ms(400)));

        let running = metrics.snapshot();
        assert_eq!(running.elapsed, ms(500));

        let snapshot = metrics.finalize();
        assert_eq!(snapshot.elapsed, ms(500));
        assert_eq!(snapshot.throughput(), 4000.0);
        assert_eq!(snapshot.ops_per_second(), 4.0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let metrics = MetricsAggregator::new(8 * 250);
        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let metrics = &metrics;
                scope.spawn(move || {
                    for i in 0..250 {
                        let id = worker * 250 + i;
                        if id % 10 == 0 {
                            metrics.record(UploadResult::failed(id, ErrorKind::ClientError, ms(1)));
                        } else {
                            metrics.record(UploadResult::succeeded(id, 10, ms(1)));
                        }
                    }
                });
            }
        });

        let snapshot = metrics.finalize();
        assert_eq!(snapshot.total_attempted, 2000);
        assert_eq!(snapshot.total_failed, 200);
        assert_eq!(snapshot.total_succeeded, 1800);
        assert_eq!(snapshot.total_bytes, 18_000);
    }
}
