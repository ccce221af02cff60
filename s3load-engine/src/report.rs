//! Rendering of the final [`RunSnapshot`].

use std::fmt::Write;
use std::time::Duration;

use bytesize::ByteSize;

use crate::metrics::RunSnapshot;

/// Renders a human-readable summary of a run.
///
/// The summary is printed even if every upload failed.
pub fn render(snapshot: &RunSnapshot) -> String {
    let mut out = String::new();
    // writing into a `String` is infallible
    let _ = write_summary(&mut out, snapshot);
    out
}

fn write_summary(out: &mut String, snapshot: &RunSnapshot) -> std::fmt::Result {
    writeln!(
        out,
        "objects:    {} attempted, {} succeeded, {} failed ({:.2}%)",
        snapshot.total_attempted,
        snapshot.total_succeeded,
        snapshot.total_failed,
        snapshot.failure_percentage(),
    )?;

    if !snapshot.failures.is_empty() {
        let failures: Vec<_> = snapshot
            .failures
            .iter()
            .map(|(kind, count)| format!("{kind}: {count}"))
            .collect();
        writeln!(out, "failures:   {}", failures.join(", "))?;
    }

    writeln!(
        out,
        "written:    {} in {:.2?}",
        ByteSize::b(snapshot.total_bytes),
        snapshot.elapsed,
    )?;
    writeln!(
        out,
        "throughput: {}/s, {:.2} objects/s",
        ByteSize::b(snapshot.throughput() as u64),
        snapshot.ops_per_second(),
    )?;

    match &snapshot.latency {
        Some(latency) => writeln!(
            out,
            "latency:    avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}; max: {:.2?}",
            latency.mean, latency.p50, latency.p90, latency.p99, latency.max,
        )?,
        None => writeln!(out, "latency:    n/a")?,
    }

    if snapshot.cancelled {
        writeln!(
            out,
            "cancelled:  {} of {} objects were dispatched",
            snapshot.total_attempted, snapshot.planned,
        )?;
    }

    Ok(())
}

/// Identifies a run and its target in the summary record.
#[derive(Clone, Copy, Debug)]
pub struct RunLabels<'a> {
    /// The run identifier, which is part of every object key.
    pub run_id: &'a str,
    /// The endpoint the objects were written to.
    pub endpoint: &'a str,
    /// The target bucket.
    pub bucket: &'a str,
    /// The region used for request signing.
    pub region: &'a str,
    /// Size of every object in bytes.
    pub object_size: u64,
}

/// Emits the snapshot as a single structured log record.
pub fn log_summary(labels: &RunLabels<'_>, snapshot: &RunSnapshot) {
    let latency = snapshot.latency;

    tracing::info!(
        run_id = %labels.run_id,
        endpoint = %labels.endpoint,
        bucket = %labels.bucket,
        region = %labels.region,
        object_size = labels.object_size,
        planned = snapshot.planned,
        attempted = snapshot.total_attempted,
        succeeded = snapshot.total_succeeded,
        failed = snapshot.total_failed,
        failure_pct = snapshot.failure_percentage(),
        total_bytes = snapshot.total_bytes,
        duration_s = snapshot.elapsed.as_secs_f64(),
        throughput_bps = snapshot.throughput(),
        p50_ms = millis(latency.map(|l| l.p50)),
        p90_ms = millis(latency.map(|l| l.p90)),
        p99_ms = millis(latency.map(|l| l.p99)),
        max_ms = millis(latency.map(|l| l.max)),
        cancelled = snapshot.cancelled,
        "upload summary"
    );
}

fn millis(duration: Option<Duration>) -> f64 {
    duration.map_or(0.0, |duration| duration.as_secs_f64() * 1000.0)
}
