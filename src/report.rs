//! Formats run snapshots into a human-readable plain-text report.
//!
//! The scheduler's only obligation is to expose its three snapshots (run
//! stats, aggregated metrics, histograms) plus the terminal status; this
//! module turns those into the tables printed at the end of a run. Anything
//! fancier (color, progress bars, structured output) belongs to an external
//! reporting tool consuming the same snapshots.

use num_format::{Locale, ToFormattedString};
use std::fmt::Write;

use crate::histogram::ALL_CATEGORIES;
use crate::metrics::{PhaseStat, RunStatsSnapshot};
use crate::util;
use crate::{RunReport, RunStatus};

// Width of the histogram bar column, in characters.
const BAR_WIDTH: usize = 40;

/// Render the full end-of-run report.
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    let stats = &report.stats;
    let elapsed = stats.elapsed;

    if report.status != RunStatus::Completed {
        let reason = match report.status {
            RunStatus::StoppedFatalError => "fatal error",
            RunStatus::StoppedAborted => "user abort",
            RunStatus::Completed => "",
        };
        if let Some(error) = &report.first_error {
            let _ = writeln!(out, "ERROR: {}", error);
        }
        let _ = writeln!(
            out,
            "Stopped test prematurely ({}): {} of {} requests completed.",
            reason,
            report.completed.to_formatted_string(&Locale::en),
            report.requested.to_formatted_string(&Locale::en)
        );
        let _ = writeln!(out);
    }

    let _ = writeln!(
        out,
        "Total requests sent: {}",
        stats.total_reqs.to_formatted_string(&Locale::en)
    );
    let _ = writeln!(out, "Total time elapsed: {}", util::format_seconds(elapsed));
    let _ = writeln!(
        out,
        "Total bytes sent: {} ({}/sec)",
        util::format_bytes(stats.bytes_sent as f64),
        util::format_bytes(per_second(stats.bytes_sent as f64, elapsed))
    );
    let _ = writeln!(
        out,
        "Total bytes received: {} ({}/sec)",
        util::format_bytes(stats.bytes_received as f64),
        util::format_bytes(per_second(stats.bytes_received as f64, elapsed))
    );
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "Average performance: {} req/sec",
        (per_second(stats.total_reqs as f64, elapsed).floor() as u64)
            .to_formatted_string(&Locale::en)
    );
    // A peak below two seconds of runtime is just the only second observed.
    if stats.peak_sec > 0 && elapsed >= 2.0 {
        let _ = writeln!(
            out,
            "Peak performance: {} req/sec",
            stats.peak_sec.to_formatted_string(&Locale::en)
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "Number of warnings: {}",
        stats.total_warnings.to_formatted_string(&Locale::en)
    );
    let _ = writeln!(
        out,
        "Number of errors: {}",
        stats.total_errors.to_formatted_string(&Locale::en)
    );
    let _ = writeln!(out);

    format_metrics_table(&mut out, report);
    format_histograms(&mut out, report);

    out
}

/// A one-line summary suitable for interim logging during a run.
pub(crate) fn running_summary(stats: &RunStatsSnapshot, requested: usize) -> String {
    format!(
        "{} of {} requests completed ({} errors, {} warnings, {} req/sec)",
        stats.total_reqs.to_formatted_string(&Locale::en),
        requested.to_formatted_string(&Locale::en),
        stats.total_errors.to_formatted_string(&Locale::en),
        stats.total_warnings.to_formatted_string(&Locale::en),
        per_second(stats.total_reqs as f64, stats.elapsed).floor() as u64
    )
}

// The min/avg/max/samples table, canonical phases first, any extra phases
// the transport reported after them.
fn format_metrics_table(out: &mut String, report: &RunReport) {
    let _ = writeln!(out, "Performance Metrics:");
    let _ = writeln!(
        out,
        "  {:<12} {:>12} {:>12} {:>12} {:>10}",
        "Metric", "Minimum", "Average", "Maximum", "Samples"
    );

    for phase in ordered_phases(report) {
        let stat = report
            .metrics
            .phases
            .get(&phase)
            .copied()
            .unwrap_or_else(PhaseStat::default);
        let _ = writeln!(
            out,
            "  {:<12} {:>12} {:>12} {:>12} {:>10}",
            display_phase_name(&phase),
            format_ms(stat.min),
            format_ms(stat.avg()),
            format_ms(stat.max),
            stat.count.to_formatted_string(&Locale::en)
        );
    }
    let _ = writeln!(out);
}

// One bucket table per tracked category that classified at least one value.
fn format_histograms(out: &mut String, report: &RunReport) {
    for (category, counts) in &report.histograms {
        if counts.is_empty() {
            continue;
        }
        let highest = counts.values().max().copied().unwrap_or(0);
        let _ = writeln!(out, "{} Time Histogram:", display_phase_name(category));
        let _ = writeln!(out, "  {:<12} {:>10}  {}", "Range", "Count", "Visual");
        for (label, count) in counts {
            let width = if highest > 0 {
                ((*count as f64 / highest as f64) * BAR_WIDTH as f64).round() as usize
            } else {
                0
            };
            let _ = writeln!(
                out,
                "  {:<12} {:>10}  {}",
                label,
                count.to_formatted_string(&Locale::en),
                "#".repeat(width)
            );
        }
        let _ = writeln!(out);
    }
}

// Canonical phase ordering for display, followed by anything else the
// transport reported, in name order.
fn ordered_phases(report: &RunReport) -> Vec<String> {
    let mut phases: Vec<String> = ALL_CATEGORIES
        .iter()
        .filter(|phase| report.metrics.phases.contains_key(**phase))
        .map(|phase| phase.to_string())
        .collect();
    for phase in report.metrics.phases.keys() {
        if !ALL_CATEGORIES.contains(&phase.as_str()) {
            phases.push(phase.clone());
        }
    }
    phases
}

// "dns" displays as "DNS", everything else with a leading capital.
fn display_phase_name(phase: &str) -> String {
    if phase == "dns" {
        return "DNS".to_string();
    }
    let mut chars = phase.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn format_ms(value: f64) -> String {
    format!("{:.1} ms", value)
}

fn per_second(value: f64, elapsed: f64) -> f64 {
    if elapsed > 0.0 {
        value / elapsed
    } else {
        0.0
    }
}
