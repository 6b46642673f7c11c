//! # Kestrel
//!
//! Kestrel is a fixed-iteration HTTP load generation tool: it drives a
//! configurable number of concurrent workers through a fixed total count of
//! request iterations against a target URL, collecting per-request timing
//! metrics, aggregating them online (min/avg/max/count per phase), bucketing
//! latencies into histograms, and applying a global per-second throttle.
//!
//! Request URLs, headers and bodies are templates resolved independently for
//! every iteration: numeric ranges (`[1-1000]`), parameter pool draws
//! (`[user]`) and inline header overrides (`[header:Cookie:uid=1]`) make
//! each request unique without any per-iteration scripting.
//!
//! Kestrel uses [`reqwest`](https://docs.rs/reqwest/) to provide a convenient
//! HTTP client, behind a swappable transport trait.
//!
//! ## Running a load test
//!
//! The `kestrel` binary drives everything from the command line:
//!
//! ```bash
//! $ kestrel http://localhost:8080/ --max 1000 --threads 4 --throttle 100
//! ```
//!
//! The same run can be launched programmatically:
//!
//! ```rust,no_run
//! use gumdrop::Options;
//! use kestrel::config::KestrelConfiguration;
//! use kestrel::{report, KestrelError, LoadTest};
//!
//! fn main() -> Result<(), KestrelError> {
//!     let configuration = KestrelConfiguration::parse_args_default_or_exit();
//!     let run_report = LoadTest::initialize_with_config(configuration)?.execute()?;
//!     println!("{}", report::format_report(&run_report));
//!     Ok(())
//! }
//! ```
//!
//! A custom transport (for example, wrapping requests with extra
//! instrumentation) can be injected with
//! [`LoadTest::set_transport`]; anything implementing
//! [`HttpTransport`](client::HttpTransport) is substitutable.

#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod histogram;
pub mod logger;
pub mod metrics;
pub mod report;
pub mod template;
mod throttle;
pub mod util;
mod worker;

use gumdrop::Options;
use serde::Serialize;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, io};
use tokio::runtime::Runtime;

use crate::client::{HttpTransport, ReqwestTransport};
use crate::config::KestrelConfiguration;
use crate::histogram::{HistogramSet, HistogramSnapshot};
use crate::logger::LogRecord;
use crate::metrics::{AggregateSnapshot, MetricsAggregator, RunStats, RunStatsSnapshot};
use crate::template::ParamPools;
use crate::throttle::ThrottleGate;
use crate::worker::WorkerContext;

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum KestrelError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Json(serde_json::Error),
    /// Failed to parse the target URL.
    InvalidHost {
        /// The invalid URL that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
}
/// Implement a helper to provide a text description of all possible types of errors.
impl KestrelError {
    fn describe(&self) -> &str {
        match *self {
            KestrelError::Io(_) => "io::Error",
            KestrelError::Reqwest(_) => "reqwest::Error",
            KestrelError::TokioJoin(_) => "tokio::task::JoinError",
            KestrelError::Json(_) => "serde_json::Error",
            KestrelError::InvalidHost { .. } => "failed to parse target URL",
            KestrelError::InvalidOption { .. } => "invalid option or value specified",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for KestrelError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            KestrelError::Io(ref source) => {
                write!(f, "KestrelError: {} ({})", self.describe(), source)
            }
            KestrelError::Reqwest(ref source) => {
                write!(f, "KestrelError: {} ({})", self.describe(), source)
            }
            KestrelError::TokioJoin(ref source) => {
                write!(f, "KestrelError: {} ({})", self.describe(), source)
            }
            KestrelError::Json(ref source) => {
                write!(f, "KestrelError: {} ({})", self.describe(), source)
            }
            KestrelError::InvalidHost {
                ref parse_error, ..
            } => write!(f, "KestrelError: {} ({})", self.describe(), parse_error),
            KestrelError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(
                f,
                "KestrelError: {} ({} {}: {})",
                self.describe(),
                option,
                value,
                detail
            ),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            KestrelError::Io(ref source) => Some(source),
            KestrelError::Reqwest(ref source) => Some(source),
            KestrelError::TokioJoin(ref source) => Some(source),
            KestrelError::Json(ref source) => Some(source),
            KestrelError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for KestrelError {
    fn from(err: reqwest::Error) -> KestrelError {
        KestrelError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for KestrelError {
    fn from(err: io::Error) -> KestrelError {
        KestrelError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for KestrelError {
    fn from(err: tokio::task::JoinError) -> KestrelError {
        KestrelError::TokioJoin(err)
    }
}

/// Auto-convert serde_json errors.
impl From<serde_json::Error> for KestrelError {
    fn from(err: serde_json::Error) -> KestrelError {
        KestrelError::Json(err)
    }
}

/// A single cooperative cancellation flag, observed by the scheduler between
/// iterations.
///
/// Set by the ctrl-c handler or by the fatal-error policy; once set it is
/// never cleared -- an aborted run cannot resume. In-flight requests are
/// never forcibly terminated, they finish and their results are still
/// recorded.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle::default()
    }

    /// Raise the flag. Idempotent and safe to call concurrently.
    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Non-blocking read of the flag.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every requested iteration was dispatched and completed.
    Completed,
    /// Fatal mode halted dispatch after the first error; iterations already
    /// in flight still completed and are counted.
    StoppedFatalError,
    /// The abort flag halted dispatch before every iteration was dispatched.
    StoppedAborted,
}

/// Everything a run exposes when it ends: terminal status, the three final
/// snapshots, and how much of the requested work completed.
///
/// A run that halts early still reports whatever iterations completed;
/// partial progress is a documented terminal state, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// How the run ended.
    pub status: RunStatus,
    /// How many iterations were requested.
    pub requested: usize,
    /// How many iterations completed (success and error alike).
    pub completed: u64,
    /// Final run-wide accumulators.
    pub stats: RunStatsSnapshot,
    /// Final per-phase statistics and counters.
    pub metrics: AggregateSnapshot,
    /// Final histogram counts per tracked category.
    pub histograms: HistogramSnapshot,
    /// The first error observed, if any.
    pub first_error: Option<String>,
}

/// Drives a fixed number of iterations across a bounded worker pool.
///
/// Dispatch follows iteration index order; completion order is
/// unconstrained. The aggregator, histograms and run stats merge
/// out-of-order concurrent updates, so no cross-structure consistency is
/// needed mid-run -- only at report time.
pub struct LoadTest {
    configuration: KestrelConfiguration,
    target_url: String,
    pools: ParamPools,
    abort: AbortHandle,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl LoadTest {
    /// Initialize from the process command line.
    pub fn initialize() -> Result<LoadTest, KestrelError> {
        LoadTest::initialize_with_config(KestrelConfiguration::parse_args_default_or_exit())
    }

    /// Initialize from an already-built configuration.
    ///
    /// Resolves the free argument (target URL or JSON configuration file),
    /// loads parameter pools, and validates everything that can fail before
    /// the first request.
    pub fn initialize_with_config(
        mut configuration: KestrelConfiguration,
    ) -> Result<LoadTest, KestrelError> {
        let inputs = config::resolve(&mut configuration)?;
        configuration.validate(&inputs.url)?;
        Ok(LoadTest {
            configuration,
            target_url: inputs.url,
            pools: inputs.pools,
            abort: AbortHandle::new(),
            transport: None,
        })
    }

    /// Replace the default reqwest-backed transport with a custom
    /// [`HttpTransport`] implementation.
    pub fn set_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// A handle to this run's abort flag, for wiring up external signal
    /// handling beyond the built-in ctrl-c hook.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Execute the load test, blocking until it completes.
    ///
    /// Creates the async runtime internally, so callers stay synchronous.
    pub fn execute(self) -> Result<RunReport, KestrelError> {
        let runtime = Runtime::new()?;
        runtime.block_on(self.run())
    }

    // The full run: launch the ancillary threads, drive the worker pool to
    // completion, then assemble the final report.
    async fn run(self) -> Result<RunReport, KestrelError> {
        let LoadTest {
            configuration,
            target_url,
            pools,
            abort,
            transport,
        } = self;

        util::setup_ctrlc_handler(&abort);

        let max_iterations = configuration.max_iterations();
        let options = configuration.transport_options()?;
        let template = configuration.template(&target_url, pools)?;
        let transport: Arc<dyn HttpTransport> = match transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&options)?),
        };

        // Never launch more workers than there are iterations to process.
        let worker_count = cmp::min(configuration.thread_count(), max_iterations);
        info!(
            "kestrel v{}: {} {} ({} requests, {} workers)",
            env!("CARGO_PKG_VERSION"),
            template.method,
            template.url,
            max_iterations,
            worker_count
        );

        // Launch the record logger when either log is enabled.
        let warnings_log = if configuration.warnings_log.is_empty() {
            None
        } else {
            Some(configuration.warnings_log.clone())
        };
        let stats_log = if configuration.stats_log.is_empty() {
            None
        } else {
            Some(configuration.stats_log.clone())
        };
        let (logger, logger_handle) = if warnings_log.is_some() || stats_log.is_some() {
            let (sender, receiver) = flume::unbounded();
            let handle = tokio::spawn(logger::logger_main(
                warnings_log,
                stats_log.clone(),
                receiver,
            ));
            (Some(sender), Some(handle))
        } else {
            (None, None)
        };

        let context = Arc::new(WorkerContext {
            template,
            transport,
            options,
            throttle: ThrottleGate::new(configuration.throttle_cap()),
            aggregator: MetricsAggregator::new(),
            histograms: HistogramSet::new(
                &configuration.histogram_categories(),
                &configuration.histogram_range_labels(),
            ),
            run_stats: RunStats::new(),
            abort: abort.clone(),
            fatal_error: AtomicBool::new(false),
            next_iteration: AtomicUsize::new(0),
            max_iterations,
            fatal: configuration.fatal,
            warn_ms: configuration.warn_ms(),
            success_match: configuration.success_pattern()?,
            error_match: configuration.error_pattern()?,
            logger: logger.clone(),
            first_error: Mutex::new(None),
        });

        // Interim metrics are a read-only snapshot, the workers never pause.
        let monitor_stop = Arc::new(AtomicBool::new(false));
        if let Some(interval) = configuration.running_metrics {
            let interval = cmp::max(interval, 1) as u64;
            let monitor_context = context.clone();
            let monitor_stop = monitor_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
                    if monitor_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    info!(
                        "{}",
                        report::running_summary(
                            &monitor_context.run_stats.snapshot(),
                            max_iterations
                        )
                    );
                }
            });
        }

        let mut workers = Vec::new();
        for thread_number in 0..worker_count {
            workers.push(tokio::spawn(worker::worker_main(
                thread_number,
                context.clone(),
            )));
        }
        for worker in futures::future::join_all(workers).await {
            worker?;
        }
        monitor_stop.store(true, Ordering::SeqCst);

        let stats = context.run_stats.snapshot();
        let completed = stats.total_reqs;
        let status = if context.fatal_error.load(Ordering::SeqCst) {
            RunStatus::StoppedFatalError
        } else if abort.is_set() && (completed as usize) < max_iterations {
            RunStatus::StoppedAborted
        } else {
            RunStatus::Completed
        };
        let first_error = context.first_error.lock().unwrap().clone();

        if status != RunStatus::Completed {
            info!(
                "stopped test prematurely: {} of {} requests completed",
                completed, max_iterations
            );
        }

        // Flush the record logger: final stats first, then the shutdown
        // message, then wait for the writes to land.
        if let Some(sender) = logger {
            if stats_log.is_some() {
                let _ = sender.send(Some(LogRecord::Stats(stats.clone())));
            }
            let _ = sender.send(None);
        }
        if let Some(handle) = logger_handle {
            handle.await??;
        }

        Ok(RunReport {
            status,
            requested: max_iterations,
            completed,
            stats,
            metrics: context.aggregator.snapshot(),
            histograms: context.histograms.snapshot(),
            first_error,
        })
    }
}
