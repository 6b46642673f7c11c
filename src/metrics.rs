//! Online aggregation of per-request timing metrics and run-wide counters.
//!
//! Every completed iteration produces a [`MetricReport`] which is folded into
//! the shared [`MetricsAggregator`] (per-phase min/avg/max/count plus named
//! counters) and into the run-wide [`RunStats`] accumulators. Both structures
//! serialize their own mutation behind a mutex, so workers record results
//! concurrently in any completion order; aggregation is order-independent.
//! Snapshots are copy-on-read and never pause the workers for longer than a
//! single update's critical section, so they are safe to take mid-run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::util;

/// Counter key tracked in [`RunStats`] for request payload bytes.
pub const BYTES_SENT: &str = "bytes_sent";
/// Counter key tracked in [`RunStats`] for response payload bytes.
pub const BYTES_RECEIVED: &str = "bytes_received";

/// Per-request outcome produced by the transport.
///
/// Consumed once by the aggregator, histograms and run stats, then discarded.
/// Also persisted verbatim inside warning records when a warnings log is
/// enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricReport {
    /// The error that failed this request, if any.
    pub error: Option<String>,
    /// The HTTP response code, 0 when no response was received.
    pub status: u16,
    /// The HTTP status text, empty when no response was received.
    pub status_text: String,
    /// Timing phases in milliseconds (ie dns, connect, send, wait, receive,
    /// decompress, total) -- whatever subset the transport measured.
    pub phases: BTreeMap<String, f64>,
    /// Named counter deltas (ie bytes_sent, bytes_received).
    pub counters: BTreeMap<String, u64>,
}

impl MetricReport {
    /// The `total` phase in milliseconds, or 0 when the transport did not
    /// measure it.
    pub fn total_ms(&self) -> f64 {
        self.phases.get("total").copied().unwrap_or(0.0)
    }
}

/// Running min/max/sum/count for one named timing phase.
///
/// Invariant: `min <= avg <= max` once `count > 0`, with `avg = sum / count`.
/// Never reset during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStat {
    /// The fastest value recorded so far, in milliseconds.
    pub min: f64,
    /// The slowest value recorded so far, in milliseconds.
    pub max: f64,
    /// Running total of all recorded values, in milliseconds.
    pub sum: f64,
    /// How many values have been recorded.
    pub count: u64,
}

impl PhaseStat {
    // Fold one value into the running stat.
    fn record(&mut self, value: f64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.count += 1;
    }

    /// The mean of all recorded values, or 0 before the first sample.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// A read-only copy of the aggregator's state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateSnapshot {
    /// Per-phase running statistics.
    pub phases: BTreeMap<String, PhaseStat>,
    /// Named counter totals.
    pub counters: BTreeMap<String, u64>,
}

/// Maintains running statistics per timing phase plus named counters.
///
/// Shared by all workers; each [`record`](MetricsAggregator::record) call is
/// effectively atomic, so concurrent updates from any completion order yield
/// the same final state.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<AggregateSnapshot>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        MetricsAggregator::default()
    }

    /// Fold one completed iteration's report into the running statistics.
    ///
    /// Phase stats and counter slots are lazily created the first time their
    /// key appears in a report.
    pub fn record(&self, report: &MetricReport) {
        let mut state = self.state.lock().unwrap();
        for (phase, value) in &report.phases {
            state
                .phases
                .entry(phase.clone())
                .or_insert_with(PhaseStat::default)
                .record(*value);
        }
        for (counter, delta) in &report.counters {
            *state.counters.entry(counter.clone()).or_insert(0) += delta;
        }
    }

    /// A read-only copy of the current state, safe to take mid-run.
    pub fn snapshot(&self) -> AggregateSnapshot {
        self.state.lock().unwrap().clone()
    }
}

/// A read-only copy of the run-wide accumulators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    /// Total completed iterations, success and error alike.
    pub total_reqs: u64,
    /// Total iterations that ended in an error.
    pub total_errors: u64,
    /// Total iterations that met or exceeded the warning threshold.
    pub total_warnings: u64,
    /// Total request payload bytes.
    pub bytes_sent: u64,
    /// Total response payload bytes.
    pub bytes_received: u64,
    /// Completions observed in the current wall-clock second so far.
    pub count_sec: u64,
    /// The most completions observed in any single wall-clock second.
    pub peak_sec: u64,
    /// Unix timestamp of the start of the run, in seconds.
    pub time_start: f64,
    /// Seconds elapsed since the start of the run.
    pub elapsed: f64,
}

// Mutable accumulator state behind the RunStats mutex.
#[derive(Debug, Default)]
struct RunState {
    total_reqs: u64,
    total_errors: u64,
    total_warnings: u64,
    bytes_sent: u64,
    bytes_received: u64,
    current_sec: u64,
    count_sec: u64,
    peak_sec: u64,
}

/// Process-wide accumulators, initialized before scheduling begins and
/// mutated by every completed iteration.
///
/// Report generation only ever reads a [`snapshot`](RunStats::snapshot).
#[derive(Debug)]
pub struct RunStats {
    started: Instant,
    time_start: f64,
    state: Mutex<RunState>,
}

impl Default for RunStats {
    fn default() -> Self {
        RunStats::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        RunStats {
            started: Instant::now(),
            time_start: util::epoch_now(),
            state: Mutex::new(RunState {
                current_sec: util::epoch_seconds(),
                ..RunState::default()
            }),
        }
    }

    /// Record one completed iteration, returning its request number (the
    /// running total after this completion).
    ///
    /// Rolls the per-second counter over when the wall-clock second has
    /// advanced since the previous completion, tracking the peak observed
    /// completions per second along the way.
    pub fn record_completion(
        &self,
        report: Option<&MetricReport>,
        is_error: bool,
        is_warning: bool,
    ) -> u64 {
        let now_sec = util::epoch_seconds();
        let mut state = self.state.lock().unwrap();

        state.count_sec += 1;
        state.total_reqs += 1;
        if now_sec != state.current_sec {
            state.current_sec = now_sec;
            if state.count_sec > state.peak_sec {
                state.peak_sec = state.count_sec;
            }
            state.count_sec = 0;
        }

        if is_error {
            state.total_errors += 1;
        }
        if is_warning {
            state.total_warnings += 1;
        }

        if let Some(report) = report {
            if let Some(sent) = report.counters.get(BYTES_SENT) {
                state.bytes_sent += sent;
            }
            if let Some(received) = report.counters.get(BYTES_RECEIVED) {
                state.bytes_received += received;
            }
        }

        state.total_reqs
    }

    /// A read-only copy of the current accumulators, safe to take mid-run.
    pub fn snapshot(&self) -> RunStatsSnapshot {
        let state = self.state.lock().unwrap();
        RunStatsSnapshot {
            total_reqs: state.total_reqs,
            total_errors: state.total_errors,
            total_warnings: state.total_warnings,
            bytes_sent: state.bytes_sent,
            bytes_received: state.bytes_received,
            count_sec: state.count_sec,
            peak_sec: state.peak_sec,
            time_start: self.time_start,
            elapsed: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(phases: &[(&str, f64)], counters: &[(&str, u64)]) -> MetricReport {
        MetricReport {
            phases: phases
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            counters: counters
                .iter()
                .map(|(name, delta)| (name.to_string(), *delta))
                .collect(),
            ..MetricReport::default()
        }
    }

    #[test]
    fn phase_stat_tracks_min_avg_max() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(&report(&[("total", 10.0)], &[]));
        aggregator.record(&report(&[("total", 20.0)], &[]));
        aggregator.record(&report(&[("total", 60.0)], &[]));

        let snapshot = aggregator.snapshot();
        let stat = snapshot.phases.get("total").unwrap();
        assert_eq!(stat.count, 3);
        assert!((stat.min - 10.0).abs() < f64::EPSILON);
        assert!((stat.max - 60.0).abs() < f64::EPSILON);
        assert!((stat.avg() - 30.0).abs() < f64::EPSILON);
        assert!(stat.min <= stat.avg() && stat.avg() <= stat.max);
    }

    #[test]
    fn zero_valued_sample_still_counts() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(&report(&[("dns", 0.0)], &[]));
        aggregator.record(&report(&[("dns", 5.0)], &[]));

        let snapshot = aggregator.snapshot();
        let stat = snapshot.phases.get("dns").unwrap();
        assert_eq!(stat.count, 2);
        assert!((stat.min - 0.0).abs() < f64::EPSILON);
        assert!((stat.max - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let reports = vec![
            report(&[("total", 50.0), ("wait", 30.0)], &[(BYTES_SENT, 100)]),
            report(&[("total", 10.0)], &[(BYTES_SENT, 5)]),
            report(&[("total", 90.0), ("wait", 1.0)], &[(BYTES_RECEIVED, 7)]),
            report(&[("total", 42.0)], &[]),
        ];

        let forward = MetricsAggregator::new();
        for r in &reports {
            forward.record(r);
        }
        let reverse = MetricsAggregator::new();
        for r in reports.iter().rev() {
            reverse.record(r);
        }

        let a = forward.snapshot();
        let b = reverse.snapshot();
        assert_eq!(a.phases, b.phases);
        assert_eq!(a.counters, b.counters);
    }

    #[test]
    fn counters_accumulate_deltas() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(&report(&[], &[(BYTES_SENT, 10), (BYTES_RECEIVED, 100)]));
        aggregator.record(&report(&[], &[(BYTES_SENT, 15)]));

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.counters.get(BYTES_SENT), Some(&25));
        assert_eq!(snapshot.counters.get(BYTES_RECEIVED), Some(&100));
    }

    #[test]
    fn run_stats_count_completions_and_bytes() {
        let stats = RunStats::new();
        let first = report(&[("total", 5.0)], &[(BYTES_SENT, 10), (BYTES_RECEIVED, 20)]);
        assert_eq!(stats.record_completion(Some(&first), false, false), 1);
        assert_eq!(stats.record_completion(None, true, false), 2);
        assert_eq!(stats.record_completion(Some(&first), false, true), 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_reqs, 3);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.total_warnings, 1);
        assert_eq!(snapshot.bytes_sent, 20);
        assert_eq!(snapshot.bytes_received, 40);
    }

    #[test]
    fn errors_without_a_report_do_not_touch_bytes() {
        let stats = RunStats::new();
        stats.record_completion(None, true, false);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.bytes_sent, 0);
        assert_eq!(snapshot.bytes_received, 0);
    }
}
