//! Optional record logging thread.
//!
//! Kestrel can persist two kinds of records during a run, enabled through any
//! combination of the following run-time options:
//!  - `--warnings-log`: one JSON record per slow request (timestamp, request
//!    number, status, and the request's full metric report);
//!  - `--stats-log`: one JSON record per run with the final [`RunStats`]
//!    snapshot, appended so repeated runs accumulate a history.
//!
//! When either log is enabled this thread is launched and a channel is
//! provided for worker threads to send records for efficient buffered
//! writing. Both files are opened in append mode; records are JSON lines.
//!
//! [`RunStats`]: crate::metrics::RunStats

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metrics::{MetricReport, RunStatsSnapshot};
use crate::KestrelError;

/// A warnings-log record describing one slow request.
#[derive(Debug, Serialize, Deserialize)]
pub struct WarningRecord {
    /// Local date/time stamp in `[YYYY-MM-DD HH:MM:SS]` format.
    pub date_time: String,
    /// Unix timestamp of the completion, in seconds.
    pub now: u64,
    /// Which completed request this was (1-based running total).
    pub req_num: u64,
    /// The HTTP response code, 0 when no response was received.
    pub code: u16,
    /// The HTTP status text.
    pub status: String,
    /// The URL that was requested.
    pub url: String,
    /// The request's full metric report.
    pub metrics: MetricReport,
}

/// Records the logger thread accepts from workers and the scheduler.
#[derive(Debug, Serialize)]
pub enum LogRecord {
    /// A slow request, written to the warnings log.
    Warning(WarningRecord),
    /// The final run stats, written to the stats log.
    Stats(RunStatsSnapshot),
}

/// Logger thread: opens the configured log files and waits for records from
/// worker threads until an empty message signals the end of the run.
pub(crate) async fn logger_main(
    warnings_log: Option<String>,
    stats_log: Option<String>,
    receiver: flume::Receiver<Option<LogRecord>>,
) -> Result<(), KestrelError> {
    let mut warnings_file = match &warnings_log {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await?;
            info!("writing slow-request records to warnings log: {}", path);
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let mut stats_file = match &stats_log {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await?;
            info!("writing final run stats to stats log: {}", path);
            Some(BufWriter::new(file))
        }
        None => None,
    };

    // Loop waiting for and writing records sent from worker threads.
    while let Ok(message) = receiver.recv_async().await {
        match message {
            Some(LogRecord::Warning(record)) => {
                if let Some(file) = warnings_file.as_mut() {
                    write_record(file, json!(record).to_string(), warnings_log.as_deref()).await;
                }
            }
            Some(LogRecord::Stats(snapshot)) => {
                if let Some(file) = stats_file.as_mut() {
                    write_record(file, json!(snapshot).to_string(), stats_log.as_deref()).await;
                }
            }
            // Empty message means it's time to exit.
            None => break,
        }
    }

    // Cleanup and flush all records to disk.
    if let Some(file) = warnings_file.as_mut() {
        let _ = file.flush().await;
    }
    if let Some(file) = stats_file.as_mut() {
        let _ = file.flush().await;
    }

    Ok(())
}

// Write one JSON line, logging instead of failing the run on error.
async fn write_record(
    file: &mut BufWriter<tokio::fs::File>,
    record: String,
    path: Option<&str>,
) {
    match file.write(format!("{}\n", record).as_ref()).await {
        Ok(_) => (),
        Err(e) => {
            warn!("failed to write to {}: {}", path.unwrap_or("log"), e);
        }
    }
}
