//! Functions and structures related to configuring a Kestrel run.
//!
//! Kestrel is configured at run time by passing in the options and flags
//! defined by the [`KestrelConfiguration`] structure. The free argument is
//! the target URL, or the path of a JSON configuration file providing one;
//! command-line options always win over configuration-file values.
//!
//! Kestrel leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help
//! text from the structure below.

use gumdrop::Options;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::client::{Method, TransportOptions};
use crate::histogram::{self, ALL_CATEGORIES};
use crate::template::{IterationTemplate, ParamPools, RequestBody};
use crate::KestrelError;

lazy_static! {
    // Anything with a scheme is a URL; anything else may be a config file.
    static ref URL_SCHEME: Regex = Regex::new(r"^\w+://").unwrap();
}

/// Runtime options available when launching a Kestrel run.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Kestrel sends a fixed number of HTTP requests at a target URL from a pool
of concurrent workers, collecting per-request timing metrics along the way.

The following runtime options are available when launching a Kestrel run:"#
)]
pub struct KestrelConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Target URL, or a JSON configuration file providing one
    #[options(free)]
    pub url: Vec<String>,

    /// Total number of requests to send (default: 1)
    #[options(no_short, meta = "COUNT")]
    pub max: Option<usize>,
    /// Number of concurrent workers (default: 1)
    #[options(no_short, meta = "COUNT")]
    pub threads: Option<usize>,
    /// Limits request rate to COUNT per second
    #[options(no_short, meta = "COUNT")]
    pub throttle: Option<usize>,
    /// Sets per-request timeout in seconds (default: 5)
    #[options(no_short, meta = "SECONDS")]
    pub timeout: Option<f32>,
    /// Aborts the run on the first error
    #[options(no_short)]
    pub fatal: bool,
    /// Warns about requests of SECONDS and longer (default: 1.0, 0 disables)
    #[options(no_short, meta = "SECONDS")]
    pub warn: Option<f32>,

    /// HTTP request method (default: get)
    #[options(no_short, meta = "METHOD")]
    pub method: Option<String>,
    /// Adds a request header ("Name: Value"), repeatable
    #[options(no_short, meta = "HEADER")]
    pub header: Vec<String>,
    /// Provides a raw request body
    #[options(no_short, meta = "DATA")]
    pub data: Option<String>,
    /// Adds a form field ("name=value"), repeatable, forces POST
    #[options(no_short, meta = "FIELD")]
    pub form: Vec<String>,
    /// Attaches a file ("field=path"), repeatable, forces multipart POST
    #[options(no_short, meta = "FILE")]
    pub file: Vec<String>,
    /// Loads parameter pools from a JSON file
    #[options(no_short, meta = "FILE")]
    pub params: Option<String>,
    /// HTTP Basic Auth credentials ("user:password")
    #[options(no_short, meta = "AUTH")]
    pub auth: Option<String>,
    /// Custom User-Agent string
    #[options(no_short, meta = "AGENT")]
    pub useragent: Option<String>,

    /// Uses HTTP keep-alive connections
    #[options(no_short)]
    pub keepalive: bool,
    /// Caches DNS lookups for the duration of the run
    #[options(no_short)]
    pub cache_dns: bool,
    /// Disables compressed responses
    #[options(no_short)]
    pub no_compress: bool,
    /// Follows up to COUNT HTTP 3xx redirects
    #[options(no_short, meta = "COUNT")]
    pub follow: Option<usize>,
    /// Retries errored requests COUNT times
    #[options(no_short, meta = "COUNT")]
    pub retries: Option<usize>,
    /// Disables validation of https certificates
    #[options(no_short)]
    pub insecure: bool,

    /// Reclassifies responses whose body does not match REGEX as errors
    #[options(no_short, meta = "REGEX")]
    pub success_match: Option<String>,
    /// Reclassifies responses whose body matches REGEX as errors
    #[options(no_short, meta = "REGEX")]
    pub error_match: Option<String>,

    /// Comma-separated histogram categories, or "all" (default: total)
    #[options(no_short, meta = "CATS")]
    pub histogram: Option<String>,
    /// Custom comma-separated histogram range labels
    #[options(no_short, meta = "RANGES")]
    pub histogram_ranges: Option<String>,

    /// Appends a JSON record per slow request to this file
    #[options(no_short, meta = "FILE")]
    pub warnings_log: String,
    /// Appends the final run stats as a JSON record to this file
    #[options(no_short, meta = "FILE")]
    pub stats_log: String,
    /// Logs an interim metrics summary every SECONDS seconds
    #[options(no_short, meta = "SECONDS")]
    pub running_metrics: Option<usize>,

    /// Enables Kestrel log file and sets name
    #[options(no_short, meta = "NAME")]
    pub log_file: String,
    /// Increases log file verbosity (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases console verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases console verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

/// The subset of run-time options a JSON configuration file may provide.
///
/// Every field is optional; values only apply where the command line did not
/// already set one. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfiguration {
    pub url: Option<String>,
    pub max: Option<usize>,
    pub threads: Option<usize>,
    pub throttle: Option<usize>,
    pub timeout: Option<f32>,
    pub warn: Option<f32>,
    pub fatal: Option<bool>,
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub data: Option<String>,
    /// Parameter pools inlined in the configuration file; a separate
    /// `--params` file wins over these.
    pub params: Option<serde_json::Value>,
    pub auth: Option<String>,
    pub useragent: Option<String>,
    pub keepalive: Option<bool>,
    pub cache_dns: Option<bool>,
    pub compress: Option<bool>,
    pub follow: Option<usize>,
    pub retries: Option<usize>,
    pub insecure: Option<bool>,
    pub success_match: Option<String>,
    pub error_match: Option<String>,
    /// Tracked histogram categories: a comma-separated string or an array.
    pub histogram: Option<serde_json::Value>,
    pub histogram_ranges: Option<Vec<String>>,
    pub warnings_log: Option<String>,
    pub stats_log: Option<String>,
    pub running_metrics: Option<usize>,
}

/// The fully resolved inputs a run is built from.
pub(crate) struct RunInputs {
    /// The concrete target URL (possibly still containing placeholders).
    pub(crate) url: String,
    /// Parameter pools referenced by `[name]` placeholders.
    pub(crate) pools: ParamPools,
}

/// Resolve the free argument into a target URL, merging in a configuration
/// file and loading parameter pools along the way.
pub(crate) fn resolve(configuration: &mut KestrelConfiguration) -> Result<RunInputs, KestrelError> {
    let target = match configuration.url.first() {
        Some(target) => target.clone(),
        None => {
            return Err(KestrelError::InvalidOption {
                option: "url".to_string(),
                value: String::new(),
                detail: "a target URL (or configuration file) is required.".to_string(),
            });
        }
    };

    let mut inline_params = None;
    let url = if URL_SCHEME.is_match(&target) {
        target
    } else if Path::new(&target).exists() {
        let contents = std::fs::read_to_string(&target)?;
        let file: FileConfiguration = serde_json::from_str(&contents)?;
        let url = match &file.url {
            Some(url) => url.clone(),
            None => {
                return Err(KestrelError::InvalidOption {
                    option: "url".to_string(),
                    value: target.clone(),
                    detail: "configuration file is missing required 'url' property.".to_string(),
                });
            }
        };
        info!("loaded configuration from {}", target);
        inline_params = file.params.clone();
        configuration.apply_file(file);
        url
    } else {
        return Err(KestrelError::InvalidOption {
            option: "url".to_string(),
            value: target,
            detail: "not a URL, and no such configuration file.".to_string(),
        });
    };

    let pools = match &configuration.params {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            let value = serde_json::from_str(&contents)?;
            parse_param_pools(&value)?
        }
        None => match inline_params {
            Some(value) => parse_param_pools(&value)?,
            None => ParamPools::new(),
        },
    };

    Ok(RunInputs { url, pools })
}

// Convert a JSON object of pools into ParamPools. Scalar values promote to
// one-element pools, mirroring how configuration files may abbreviate them.
fn parse_param_pools(value: &serde_json::Value) -> Result<ParamPools, KestrelError> {
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            return Err(KestrelError::InvalidOption {
                option: "--params".to_string(),
                value: value.to_string(),
                detail: "expected a JSON object mapping pool names to values.".to_string(),
            });
        }
    };

    let mut pools = ParamPools::new();
    for (name, entry) in object {
        let candidates = match entry {
            serde_json::Value::Array(values) => {
                values.iter().map(json_value_to_string).collect()
            }
            other => vec![json_value_to_string(other)],
        };
        pools.insert(name.clone(), candidates);
    }
    Ok(pools)
}

// Pool entries are usually strings, but numbers and other scalars work too.
fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl KestrelConfiguration {
    /// Total number of logical iterations to dispatch.
    pub(crate) fn max_iterations(&self) -> usize {
        self.max.unwrap_or(1)
    }

    /// Number of concurrently active workers.
    pub(crate) fn thread_count(&self) -> usize {
        cmp::max(self.threads.unwrap_or(1), 1)
    }

    /// Warning threshold in milliseconds; 0 disables warnings.
    pub(crate) fn warn_ms(&self) -> f64 {
        self.warn.unwrap_or(1.0) as f64 * 1_000.0
    }

    /// Global admissions-per-second cap; 0 disables throttling.
    pub(crate) fn throttle_cap(&self) -> usize {
        self.throttle.unwrap_or(0)
    }

    /// Map configuration onto the declarative transport options.
    pub fn transport_options(&self) -> Result<TransportOptions, KestrelError> {
        let mut options = TransportOptions::default();
        if let Some(timeout) = self.timeout {
            options.timeout = Duration::from_secs_f32(timeout);
        }
        options.keep_alive = self.keepalive;
        if self.cache_dns {
            // Cache for the duration of the run; a day outlives any run.
            options.dns_cache_ttl = Some(Duration::from_secs(86_400));
        }
        options.compression = !self.no_compress;
        if let Some(follow) = self.follow {
            options.follow_redirects = follow;
        }
        if let Some(retries) = self.retries {
            options.retries = retries;
        }
        options.accept_invalid_certs = self.insecure;
        if let Some(auth) = &self.auth {
            match auth.split_once(':') {
                Some((user, password)) => {
                    options.basic_auth = Some((user.to_string(), password.to_string()));
                }
                None => {
                    return Err(KestrelError::InvalidOption {
                        option: "--auth".to_string(),
                        value: auth.clone(),
                        detail: "expected \"user:password\".".to_string(),
                    });
                }
            }
        }
        if let Some(useragent) = &self.useragent {
            options.user_agent = useragent.clone();
        }
        Ok(options)
    }

    /// Build the immutable iteration template for the run.
    pub(crate) fn template(
        &self,
        url: &str,
        pools: ParamPools,
    ) -> Result<IterationTemplate, KestrelError> {
        let mut method = match &self.method {
            Some(name) => name.parse::<Method>()?,
            None => Method::Get,
        };

        let mut headers = BTreeMap::new();
        for header in &self.header {
            match header.split_once(':') {
                Some((name, value)) => {
                    headers.insert(name.trim().to_string(), value.trim().to_string());
                }
                None => {
                    return Err(KestrelError::InvalidOption {
                        option: "--header".to_string(),
                        value: header.clone(),
                        detail: "expected \"Name: Value\".".to_string(),
                    });
                }
            }
        }

        let mut form_fields = BTreeMap::new();
        for field in &self.form {
            match field.split_once('=') {
                Some((name, value)) => {
                    form_fields.insert(name.to_string(), value.to_string());
                }
                None => {
                    return Err(KestrelError::InvalidOption {
                        option: "--form".to_string(),
                        value: field.clone(),
                        detail: "expected \"name=value\".".to_string(),
                    });
                }
            }
        }

        let mut files = BTreeMap::new();
        for file in &self.file {
            match file.split_once('=') {
                Some((field, path)) => {
                    files.insert(field.to_string(), path.to_string());
                }
                None => {
                    return Err(KestrelError::InvalidOption {
                        option: "--file".to_string(),
                        value: file.clone(),
                        detail: "expected \"field=path\".".to_string(),
                    });
                }
            }
        }

        let mut body = None;
        if let Some(data) = &self.data {
            if !form_fields.is_empty() {
                return Err(KestrelError::InvalidOption {
                    option: "--data".to_string(),
                    value: data.clone(),
                    detail: "cannot be combined with --form.".to_string(),
                });
            }
            // A raw body without an explicit content type is sent as a
            // form-encoded payload.
            if !headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("content-type"))
            {
                headers.insert(
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                );
            }
            body = Some(RequestBody::Raw(data.clone()));
        }
        if !form_fields.is_empty() {
            body = Some(RequestBody::Form(form_fields));
            method = Method::Post;
        }
        if !files.is_empty() {
            method = Method::Post;
        }

        Ok(IterationTemplate {
            url: url.to_string(),
            method,
            headers,
            body,
            files,
            params: pools,
        })
    }

    /// The compiled success-match pattern, when one is configured.
    pub(crate) fn success_pattern(&self) -> Result<Option<Regex>, KestrelError> {
        compile_pattern(&self.success_match, "--success-match")
    }

    /// The compiled error-match pattern, when one is configured.
    pub(crate) fn error_pattern(&self) -> Result<Option<Regex>, KestrelError> {
        compile_pattern(&self.error_match, "--error-match")
    }

    /// The histogram categories to track: `"all"` expands to every phase,
    /// otherwise a comma-separated list, defaulting to `total` alone.
    pub(crate) fn histogram_categories(&self) -> Vec<String> {
        match &self.histogram {
            Some(value) if value == "all" => ALL_CATEGORIES
                .iter()
                .map(|category| category.to_string())
                .collect(),
            Some(value) => value
                .split(',')
                .map(|category| category.trim().to_string())
                .filter(|category| !category.is_empty())
                .collect(),
            None => vec!["total".to_string()],
        }
    }

    /// The histogram bucket labels, custom or default.
    pub(crate) fn histogram_range_labels(&self) -> Vec<String> {
        match &self.histogram_ranges {
            Some(ranges) => ranges
                .split(',')
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect(),
            None => histogram::default_range_labels(),
        }
    }

    /// Validate option values that can only be checked in combination.
    pub(crate) fn validate(&self, url: &str) -> Result<(), KestrelError> {
        url::Url::parse(url).map_err(|parse_error| KestrelError::InvalidHost {
            host: url.to_string(),
            detail: "invalid target URL.".to_string(),
            parse_error,
        })?;

        if self.threads == Some(0) {
            return Err(KestrelError::InvalidOption {
                option: "--threads".to_string(),
                value: "0".to_string(),
                detail: "at least one worker is required.".to_string(),
            });
        }
        if let Some(timeout) = self.timeout {
            if timeout <= 0.0 {
                return Err(KestrelError::InvalidOption {
                    option: "--timeout".to_string(),
                    value: timeout.to_string(),
                    detail: "timeout must be greater than zero.".to_string(),
                });
            }
        }
        if let Some(warn) = self.warn {
            if warn < 0.0 {
                return Err(KestrelError::InvalidOption {
                    option: "--warn".to_string(),
                    value: warn.to_string(),
                    detail: "warning threshold cannot be negative.".to_string(),
                });
            }
        }

        // Compile-check the match patterns so a bad regex fails at startup
        // rather than on the first response.
        self.success_pattern()?;
        self.error_pattern()?;

        Ok(())
    }

    // Merge configuration-file values in under the command line.
    fn apply_file(&mut self, file: FileConfiguration) {
        if self.max.is_none() {
            self.max = file.max;
        }
        if self.threads.is_none() {
            self.threads = file.threads;
        }
        if self.throttle.is_none() {
            self.throttle = file.throttle;
        }
        if self.timeout.is_none() {
            self.timeout = file.timeout;
        }
        if self.warn.is_none() {
            self.warn = file.warn;
        }
        if !self.fatal {
            self.fatal = file.fatal.unwrap_or(false);
        }
        if self.method.is_none() {
            self.method = file.method;
        }
        if let Some(headers) = file.headers {
            for (name, value) in headers {
                let prefix = format!("{}:", name.to_lowercase());
                if !self
                    .header
                    .iter()
                    .any(|header| header.to_lowercase().starts_with(&prefix))
                {
                    self.header.push(format!("{}: {}", name, value));
                }
            }
        }
        if self.data.is_none() {
            self.data = file.data;
        }
        if self.auth.is_none() {
            self.auth = file.auth;
        }
        if self.useragent.is_none() {
            self.useragent = file.useragent;
        }
        if !self.keepalive {
            self.keepalive = file.keepalive.unwrap_or(false);
        }
        if !self.cache_dns {
            self.cache_dns = file.cache_dns.unwrap_or(false);
        }
        if !self.no_compress && file.compress == Some(false) {
            self.no_compress = true;
        }
        if self.follow.is_none() {
            self.follow = file.follow;
        }
        if self.retries.is_none() {
            self.retries = file.retries;
        }
        if !self.insecure {
            self.insecure = file.insecure.unwrap_or(false);
        }
        if self.success_match.is_none() {
            self.success_match = file.success_match;
        }
        if self.error_match.is_none() {
            self.error_match = file.error_match;
        }
        if self.histogram.is_none() {
            self.histogram = file.histogram.as_ref().map(|value| match value {
                serde_json::Value::Array(categories) => categories
                    .iter()
                    .map(json_value_to_string)
                    .collect::<Vec<String>>()
                    .join(","),
                other => json_value_to_string(other),
            });
        }
        if self.histogram_ranges.is_none() {
            self.histogram_ranges = file.histogram_ranges.map(|ranges| ranges.join(","));
        }
        if self.warnings_log.is_empty() {
            if let Some(path) = file.warnings_log {
                self.warnings_log = path;
            }
        }
        if self.stats_log.is_empty() {
            if let Some(path) = file.stats_log {
                self.stats_log = path;
            }
        }
        if self.running_metrics.is_none() {
            self.running_metrics = file.running_metrics;
        }
    }
}

// Compile an optional user-supplied regex, reporting which option carried it
// on failure.
fn compile_pattern(
    pattern: &Option<String>,
    option: &str,
) -> Result<Option<Regex>, KestrelError> {
    match pattern {
        Some(pattern) => match Regex::new(pattern) {
            Ok(regex) => Ok(Some(regex)),
            Err(e) => Err(KestrelError::InvalidOption {
                option: option.to_string(),
                value: pattern.clone(),
                detail: format!("invalid regular expression: {}", e),
            }),
        },
        None => Ok(None),
    }
}
