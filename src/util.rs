//! Utility functions used by Kestrel.

use chrono::{Local, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::AbortHandle;

/// The current Unix timestamp with second granularity.
///
/// The throttle gate and the per-second request counters both key off this
/// value, so a "second" means the same thing everywhere in the scheduler.
pub(crate) fn epoch_seconds() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    }
}

/// The current Unix timestamp with sub-second granularity.
pub(crate) fn epoch_now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs_f64(),
        Err(_) => 0.0,
    }
}

/// Return a date/time stamp in `[YYYY-MM-DD HH:MM:SS]` format, local time.
pub fn date_time_stamp(epoch: u64) -> String {
    match Local.timestamp_opt(epoch as i64, 0).single() {
        Some(date_time) => format!("[{}]", date_time.format("%Y-%m-%d %H:%M:%S")),
        None => format!("[{}]", epoch),
    }
}

/// Convert a byte count into a short human-readable string.
///
/// # Example
/// ```rust
/// use kestrel::util;
///
/// // Anything below one kilobyte displays as bytes.
/// assert_eq!(util::format_bytes(512.0), "512 B");
///
/// // Larger values scale through K, MB and GB.
/// assert_eq!(util::format_bytes(2048.0), "2 K");
/// assert_eq!(util::format_bytes(1536.0), "1.5 K");
/// assert_eq!(util::format_bytes(3.0 * 1024.0 * 1024.0), "3 MB");
/// ```
pub fn format_bytes(bytes: f64) -> String {
    const K: f64 = 1_024.0;
    const MB: f64 = 1_024.0 * 1_024.0;
    const GB: f64 = 1_024.0 * 1_024.0 * 1_024.0;

    if bytes < K {
        return format!("{} B", bytes.max(0.0).floor() as u64);
    }
    let (value, suffix) = if bytes < MB {
        (bytes / K, "K")
    } else if bytes < GB {
        (bytes / MB, "MB")
    } else {
        (bytes / GB, "GB")
    };
    let formatted = format!("{:.1}", value);
    let formatted = formatted.trim_end_matches(".0");
    format!("{} {}", formatted, suffix)
}

/// Convert a number of seconds into a short human-readable string.
///
/// # Example
/// ```rust
/// use kestrel::util;
///
/// // Sub-second durations display as milliseconds.
/// assert_eq!(util::format_seconds(0.45), "450 ms");
///
/// // Longer durations decompose into hours, minutes and seconds.
/// assert_eq!(util::format_seconds(45.0), "45 seconds");
/// assert_eq!(util::format_seconds(90.0), "1 minute 30 seconds");
/// assert_eq!(util::format_seconds(3723.0), "1 hour 2 minutes 3 seconds");
/// ```
pub fn format_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        return format!("{} ms", (seconds * 1_000.0).floor() as u64);
    }

    let total = seconds.floor() as u64;
    let hours = total / 3_600;
    let minutes = (total % 3_600) / 60;
    let secs = total % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(plural(hours, "hour"));
    }
    if minutes > 0 {
        parts.push(plural(minutes, "minute"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(plural(secs, "second"));
    }
    parts.join(" ")
}

// Format a count with a singular or plural unit name.
fn plural(count: u64, unit: &str) -> String {
    if count == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", count, unit)
    }
}

// Internal helper to configure the control-c handler. Raise the abort flag on
// the first ctrl-c so the scheduler can wind down cleanly. Exit abruptly on
// the second ctrl-c.
pub(crate) fn setup_ctrlc_handler(abort: &AbortHandle) {
    let handle = abort.clone();
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, determine if it's the first time or an additional time.
        if handle.is_set() {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            handle.signal();
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            // A handler from an earlier run in this process (as happens in
            // tests) is already installed; the abort flag is per-run so the
            // stale handler is harmless.
            info!("ctrl-c handler already installed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(1.0), "1 B");
        assert_eq!(format_bytes(1023.0), "1023 B");
        assert_eq!(format_bytes(1024.0), "1 K");
        assert_eq!(format_bytes(1536.0), "1.5 K");
        assert_eq!(format_bytes(10.0 * 1024.0 * 1024.0), "10 MB");
        assert_eq!(format_bytes(2.5 * 1024.0 * 1024.0 * 1024.0), "2.5 GB");
    }

    #[test]
    fn seconds() {
        assert_eq!(format_seconds(0.0), "0 ms");
        assert_eq!(format_seconds(0.999), "999 ms");
        assert_eq!(format_seconds(1.0), "1 second");
        assert_eq!(format_seconds(59.0), "59 seconds");
        assert_eq!(format_seconds(60.0), "1 minute");
        assert_eq!(format_seconds(61.0), "1 minute 1 second");
        assert_eq!(format_seconds(3600.0), "1 hour");
        assert_eq!(format_seconds(7384.0), "2 hours 3 minutes 4 seconds");
    }

    #[test]
    fn stamp_shape() {
        let stamp = date_time_stamp(1_500_000_000);
        assert!(stamp.starts_with('['));
        assert!(stamp.ends_with(']'));
        // "[YYYY-MM-DD HH:MM:SS]" is always 21 characters.
        assert_eq!(stamp.len(), 21);
    }

    #[test]
    fn epoch_progresses() {
        assert!(epoch_seconds() > 1_500_000_000);
        assert!(epoch_now() > 1_500_000_000.0);
    }
}
