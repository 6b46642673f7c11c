//! The per-worker iteration loop.
//!
//! Each worker repeatedly claims the next iteration index from the shared
//! dispatch counter and processes it to completion: throttle admission,
//! template resolution, the transport call, content-match reclassification,
//! error policy, and metric recording. Workers stop when every iteration has
//! been claimed or the abort flag is raised; an iteration already in flight
//! when the flag goes up still finishes and is still recorded.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::client::{HttpTransport, TransportError, TransportOptions, TransportResponse};
use crate::histogram::HistogramSet;
use crate::logger::{LogRecord, WarningRecord};
use crate::metrics::{MetricReport, MetricsAggregator, RunStats};
use crate::template::IterationTemplate;
use crate::throttle::ThrottleGate;
use crate::util;
use crate::AbortHandle;

/// State shared by every worker in the pool.
pub(crate) struct WorkerContext {
    /// Read-only request template; each iteration derives a private copy.
    pub(crate) template: IterationTemplate,
    /// The transport capability invoked for every iteration.
    pub(crate) transport: Arc<dyn HttpTransport>,
    /// Transport-level options, fixed for the run.
    pub(crate) options: TransportOptions,
    /// Global per-second admission gate.
    pub(crate) throttle: ThrottleGate,
    /// Per-phase running statistics.
    pub(crate) aggregator: MetricsAggregator,
    /// Latency histograms for the tracked categories.
    pub(crate) histograms: HistogramSet,
    /// Run-wide accumulators.
    pub(crate) run_stats: RunStats,
    /// Cooperative cancellation flag.
    pub(crate) abort: AbortHandle,
    /// Set when the abort flag was raised by the fatal-error policy rather
    /// than an external signal.
    pub(crate) fatal_error: AtomicBool,
    /// The next iteration index to dispatch.
    pub(crate) next_iteration: AtomicUsize,
    /// Total iterations in the run.
    pub(crate) max_iterations: usize,
    /// Whether the first error halts further dispatch.
    pub(crate) fatal: bool,
    /// Warning threshold in milliseconds, 0 disables warnings.
    pub(crate) warn_ms: f64,
    /// Reclassify responses whose body does not match as errors.
    pub(crate) success_match: Option<Regex>,
    /// Reclassify responses whose body matches as errors.
    pub(crate) error_match: Option<Regex>,
    /// Channel to the record logger thread, when one is running.
    pub(crate) logger: Option<flume::Sender<Option<LogRecord>>>,
    /// The first error observed during the run.
    pub(crate) first_error: Mutex<Option<String>>,
}

// The normalized outcome of one transport call, after content-match
// reclassification.
struct IterationOutcome {
    report: Option<MetricReport>,
    error: Option<String>,
    status: u16,
    status_text: String,
}

pub(crate) async fn worker_main(thread_number: usize, context: Arc<WorkerContext>) {
    info!("launching worker {}...", thread_number);

    loop {
        // Stop dispatching once the abort flag is up; iterations already in
        // flight on other workers are allowed to finish.
        if context.abort.is_set() {
            break;
        }

        // Claim the next iteration; the run is over when they are all taken.
        let index = context.next_iteration.fetch_add(1, Ordering::SeqCst);
        if index >= context.max_iterations {
            break;
        }

        context.throttle.admit().await;

        let request = context.template.resolve();
        let url = request.url.clone();
        debug!(
            "[worker {}]: iteration {}: {} {}",
            thread_number, index, request.method, url
        );

        let result = context.transport.request(&request, &context.options).await;
        let outcome = classify(result, &context);

        let is_error = outcome.error.is_some();
        let total_ms = outcome
            .report
            .as_ref()
            .map(|report| report.total_ms())
            .unwrap_or(0.0);
        let is_warning = context.warn_ms > 0.0 && total_ms >= context.warn_ms;

        // Record the completion whatever the outcome; timing data aggregates
        // whenever the transport collected any.
        let request_number =
            context
                .run_stats
                .record_completion(outcome.report.as_ref(), is_error, is_warning);
        if let Some(report) = &outcome.report {
            context.aggregator.record(report);
            context.histograms.classify_report(report);
            debug!(
                "req #{}: HTTP {} {} -- {}",
                request_number,
                outcome.status,
                outcome.status_text,
                json!(report)
            );
        }

        if is_warning {
            warn!(
                "req #{}: slow response: {:.1} ms (HTTP {} {})",
                request_number, total_ms, outcome.status, outcome.status_text
            );
            if let Some(logger) = &context.logger {
                let now = util::epoch_seconds();
                let record = WarningRecord {
                    date_time: util::date_time_stamp(now),
                    now,
                    req_num: request_number,
                    code: outcome.status,
                    status: outcome.status_text.clone(),
                    url: url.clone(),
                    metrics: outcome.report.clone().unwrap_or_default(),
                };
                // Best effort, a logging problem never fails the run.
                let _ = logger.send(Some(LogRecord::Warning(record)));
            }
        }

        if let Some(message) = &outcome.error {
            {
                let mut first_error = context.first_error.lock().unwrap();
                if first_error.is_none() {
                    *first_error = Some(message.clone());
                }
            }
            if context.fatal {
                error!(
                    "fatal error on iteration {}: {}, halting dispatch",
                    index, message
                );
                context.fatal_error.store(true, Ordering::SeqCst);
                context.abort.signal();
            } else {
                warn!("req #{} error: {} ({})", request_number, message, url);
            }
        }
    }

    info!("exiting worker {}...", thread_number);
}

// Apply content-match reclassification and normalize the transport result.
//
// An otherwise-successful response becomes an error when a configured
// success pattern fails to match the body, or an error pattern matches it.
// This happens before the error policy sees the outcome.
fn classify(
    result: Result<TransportResponse, TransportError>,
    context: &WorkerContext,
) -> IterationOutcome {
    match result {
        Ok(response) => {
            let mut error = None;
            if context.success_match.is_some() || context.error_match.is_some() {
                let text = String::from_utf8_lossy(&response.body);
                if let Some(pattern) = &context.success_match {
                    if !pattern.is_match(&text) {
                        error = Some(format!(
                            "response does not contain success match ({})",
                            pattern
                        ));
                    }
                }
                if error.is_none() {
                    if let Some(pattern) = &context.error_match {
                        if pattern.is_match(&text) {
                            error =
                                Some(format!("response contains error match ({})", pattern));
                        }
                    }
                }
            }

            let mut report = response.report;
            if let Some(message) = &error {
                report.error = Some(message.clone());
            }
            IterationOutcome {
                report: Some(report),
                error,
                status: response.status,
                status_text: response.status_text,
            }
        }
        Err(transport_error) => {
            let status = transport_error
                .report
                .as_ref()
                .map(|report| report.status)
                .unwrap_or(0);
            let status_text = transport_error
                .report
                .as_ref()
                .map(|report| report.status_text.clone())
                .unwrap_or_default();
            IterationOutcome {
                report: transport_error.report,
                error: Some(transport_error.message),
                status,
                status_text,
            }
        }
    }
}
