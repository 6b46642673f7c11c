//! Buckets per-request latencies into labeled, half-open time ranges.
//!
//! Each tracked category (a timing phase such as `total` or `connect`) keeps
//! its own label-to-count mapping over a shared, ordered set of buckets.
//! Buckets are parsed from human-readable labels (`"0-1 ms"`, `"500-1000 ms"`,
//! `"5+ sec"`) and cover the half-open interval `[low, high)`; the trailing
//! `+` form is open-ended up to a day. A value is classified into the first
//! bucket containing it; values matching no bucket are silently dropped, and
//! categories that are not tracked are silently ignored.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Mutex;

lazy_static! {
    // Bounded range label, ie "5-10 ms" or "1-2 sec".
    static ref BOUNDED_RANGE: Regex = Regex::new(r"^(\d+)-(\d+)\s*(\w+)$").unwrap();
    // Open-ended range label, ie "5+ sec".
    static ref OPEN_RANGE: Regex = Regex::new(r"^(\d+)\+\s*(\w+)$").unwrap();
}

// Upper bound for open-ended buckets: one day in milliseconds is far beyond
// any per-request timeout.
const OPEN_RANGE_LIMIT: f64 = 86_400.0;

/// The timing phases a histogram category may track.
pub const ALL_CATEGORIES: &[&str] = &[
    "dns",
    "connect",
    "send",
    "wait",
    "receive",
    "decompress",
    "total",
];

/// One half-open latency range `[low, high)`, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    /// Inclusive lower bound, in milliseconds.
    pub low: f64,
    /// Exclusive upper bound, in milliseconds.
    pub high: f64,
    /// The human-readable label counts are reported under.
    pub label: String,
}

/// Parse a bucket from its label, ie `"50-100 ms"` or `"5+ sec"`.
///
/// Returns [`None`] for labels in neither form. A `sec` unit scales both
/// bounds to milliseconds.
pub fn parse_bucket_label(label: &str) -> Option<HistogramBucket> {
    let label = label.trim();
    if let Some(caps) = BOUNDED_RANGE.captures(label) {
        let mut low = caps[1].parse::<f64>().ok()?;
        let mut high = caps[2].parse::<f64>().ok()?;
        if &caps[3] == "sec" {
            low *= 1_000.0;
            high *= 1_000.0;
        }
        return Some(HistogramBucket {
            low,
            high,
            label: label.to_string(),
        });
    }
    if let Some(caps) = OPEN_RANGE.captures(label) {
        let mut low = caps[1].parse::<f64>().ok()?;
        let mut high = OPEN_RANGE_LIMIT;
        if &caps[2] == "sec" {
            low *= 1_000.0;
            high *= 1_000.0;
        }
        return Some(HistogramBucket {
            low,
            high,
            label: label.to_string(),
        });
    }
    None
}

/// The default bucket labels, spanning sub-millisecond responses up to an
/// open-ended five-seconds-and-beyond bucket.
pub fn default_range_labels() -> Vec<String> {
    [
        "0-1 ms",
        "1-2 ms",
        "2-3 ms",
        "3-4 ms",
        "4-5 ms",
        "5-10 ms",
        "10-20 ms",
        "20-30 ms",
        "30-40 ms",
        "40-50 ms",
        "50-100 ms",
        "100-200 ms",
        "200-300 ms",
        "300-400 ms",
        "400-500 ms",
        "500-1000 ms",
        "1-2 sec",
        "2-3 sec",
        "3-4 sec",
        "4-5 sec",
        "5+ sec",
    ]
    .iter()
    .map(|label| label.to_string())
    .collect()
}

/// A read-only copy of all histogram counts, category to label to count.
pub type HistogramSnapshot = BTreeMap<String, BTreeMap<String, u64>>;

/// Classifies timing values into labeled buckets for a fixed set of tracked
/// categories.
///
/// Shared by all workers; mutation is serialized behind a mutex and
/// classification order does not affect the final counts.
#[derive(Debug)]
pub struct HistogramSet {
    buckets: Vec<HistogramBucket>,
    categories: Vec<String>,
    state: Mutex<HistogramSnapshot>,
}

impl HistogramSet {
    /// Build a histogram set tracking `categories` over the buckets parsed
    /// from `range_labels`.
    ///
    /// Labels that parse to no valid bucket are skipped with a warning.
    pub fn new(categories: &[String], range_labels: &[String]) -> Self {
        let mut buckets = Vec::new();
        for label in range_labels {
            match parse_bucket_label(label) {
                Some(bucket) => buckets.push(bucket),
                None => warn!("ignoring unparseable histogram range: {}", label),
            }
        }

        let mut state = HistogramSnapshot::new();
        for category in categories {
            state.insert(category.clone(), BTreeMap::new());
        }

        HistogramSet {
            buckets,
            categories: categories.to_vec(),
            state: Mutex::new(state),
        }
    }

    /// The categories this set tracks.
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Classify one timing value into the first bucket containing it.
    ///
    /// Untracked categories and values outside every bucket are silently
    /// ignored.
    pub fn classify(&self, category: &str, value_ms: f64) {
        let mut state = self.state.lock().unwrap();
        let counts = match state.get_mut(category) {
            Some(counts) => counts,
            None => return,
        };
        for bucket in &self.buckets {
            if value_ms >= bucket.low && value_ms < bucket.high {
                *counts.entry(bucket.label.clone()).or_insert(0) += 1;
                return;
            }
        }
    }

    /// Classify every tracked category's phase from one report.
    ///
    /// A phase absent from the report classifies as 0, mirroring how a
    /// request with no measurable time for a phase still completes it.
    pub fn classify_report(&self, report: &crate::metrics::MetricReport) {
        for category in &self.categories {
            let value = report.phases.get(category).copied().unwrap_or(0.0);
            self.classify(category, value);
        }
    }

    /// A read-only copy of all counts, safe to take mid-run.
    pub fn snapshot(&self) -> HistogramSnapshot {
        self.state.lock().unwrap().clone()
    }
}
