//! The HTTP transport capability invoked for every iteration.
//!
//! The scheduler is transport-agnostic: it hands a [`ResolvedRequest`] and
//! the run's [`TransportOptions`] to an [`HttpTransport`] implementation and
//! receives either a [`TransportResponse`] or a [`TransportError`], both
//! carrying a [`MetricReport`] with whatever timing phases the transport
//! measured. Retries, redirects, keep-alive and DNS caching are internal to
//! the transport and invisible to the scheduler except through the final
//! outcome and its timings.
//!
//! [`ReqwestTransport`] is the default implementation, built on
//! [`reqwest`](https://docs.rs/reqwest/). Any conforming implementation is
//! substitutable, for example to wrap requests with custom instrumentation
//! or to drive a different client library.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::metrics::{MetricReport, BYTES_RECEIVED, BYTES_SENT};
use crate::template::{RequestBody, ResolvedRequest};
use crate::KestrelError;

/// The HTTP request methods Kestrel can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    /// The canonical uppercase name of this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Convert a case-insensitive method name, ie `"get"` or `"POST"`.
impl FromStr for Method {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" => Ok(Method::Get),
            "post" => Ok(Method::Post),
            "head" => Ok(Method::Head),
            "put" => Ok(Method::Put),
            "delete" => Ok(Method::Delete),
            _ => Err(KestrelError::InvalidOption {
                option: "--method".to_string(),
                value: s.to_string(),
                detail: "expected one of get, post, head, put, delete.".to_string(),
            }),
        }
    }
}

/// Declarative transport-level options, fixed for the duration of a run.
///
/// The scheduler passes these through untouched; how faithfully each knob is
/// honored is up to the transport implementation.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Reuse connections across requests.
    pub keep_alive: bool,
    /// How long resolved addresses may be reused. [`ReqwestTransport`] can
    /// not control the resolver directly, so this only extends how long idle
    /// connections are kept around; a custom transport may honor it fully.
    pub dns_cache_ttl: Option<Duration>,
    /// Accept compressed responses.
    pub compression: bool,
    /// Follow up to this many HTTP 3xx redirects, 0 disables following.
    pub follow_redirects: usize,
    /// Retry errored requests this many times before reporting the error.
    pub retries: usize,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
    /// Optional HTTP Basic Auth credentials.
    pub basic_auth: Option<(String, String)>,
    /// The User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            timeout: Duration::from_secs(5),
            keep_alive: false,
            dns_cache_ttl: None,
            compression: true,
            follow_redirects: 0,
            retries: 0,
            accept_invalid_certs: false,
            basic_auth: None,
            user_agent: format!("Mozilla/5.0; kestrel/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A successful transport result.
#[derive(Debug)]
pub struct TransportResponse {
    /// The HTTP response code.
    pub status: u16,
    /// The HTTP status text.
    pub status_text: String,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// The full response body.
    pub body: Vec<u8>,
    /// Timing phases and byte counters collected for this request.
    pub report: MetricReport,
}

/// A failed transport result.
///
/// Carries whatever diagnostics were available at the point of failure,
/// including a partial [`MetricReport`] when timing data was collected
/// before the request failed.
#[derive(Debug)]
pub struct TransportError {
    /// What went wrong.
    pub message: String,
    /// The URL that was being requested.
    pub url: String,
    /// Response headers, when a response was at least partially received.
    pub headers: Option<BTreeMap<String, String>>,
    /// Response body, when one was received.
    pub body: Option<String>,
    /// Timing collected before the failure, when any was.
    pub report: Option<MetricReport>,
}

impl TransportError {
    pub(crate) fn new(message: String, url: &str) -> Self {
        TransportError {
            message,
            url: url.to_string(),
            headers: None,
            body: None,
            report: None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.url)
    }
}

impl std::error::Error for TransportError {}

/// A polymorphic HTTP transport capability, one method per verb.
///
/// The scheduler invokes [`request`](HttpTransport::request), which
/// dispatches on the resolved request's method. Implementations own all
/// connection-level behavior: retries, redirects, keep-alive, DNS caching
/// and timeout enforcement.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError>;

    async fn post(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError>;

    async fn head(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError>;

    async fn put(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError>;

    async fn delete(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError>;

    /// Dispatch on the resolved request's method.
    async fn request(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        match request.method {
            Method::Get => self.get(request, options).await,
            Method::Post => self.post(request, options).await,
            Method::Head => self.head(request, options).await,
            Method::Put => self.put(request, options).await,
            Method::Delete => self.delete(request, options).await,
        }
    }
}

/// The default transport, built on a shared [`reqwest::Client`].
///
/// Measures `send` (request preparation, including reading any file
/// attachments), `wait` (time to response headers), `receive` (body
/// download) and `total` phases, plus `bytes_sent`/`bytes_received`
/// counters. Non-2xx responses are reported as errors, carrying the full
/// response for diagnostics.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client honoring the run's transport options.
    pub fn new(options: &TransportOptions) -> Result<Self, KestrelError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&options.user_agent)
            .timeout(options.timeout)
            .gzip(options.compression)
            .danger_accept_invalid_certs(options.accept_invalid_certs);

        builder = if options.follow_redirects > 0 {
            builder.redirect(Policy::limited(options.follow_redirects))
        } else {
            builder.redirect(Policy::none())
        };

        if options.keep_alive {
            builder = builder.tcp_keepalive(Duration::from_secs(60));
            if let Some(ttl) = options.dns_cache_ttl {
                builder = builder.pool_idle_timeout(ttl);
            }
        } else {
            // Without keep-alive every iteration opens a fresh connection.
            builder = builder.pool_max_idle_per_host(0);
        }

        Ok(ReqwestTransport {
            client: builder.build()?,
        })
    }

    // Issue the request once per attempt until it succeeds or the configured
    // retries are exhausted.
    async fn execute(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        let mut attempt = 0;
        loop {
            match self.try_once(request, options).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if attempt >= options.retries {
                        return Err(error);
                    }
                    attempt += 1;
                    debug!(
                        "retrying {} ({} of {}): {}",
                        request.url, attempt, options.retries, error.message
                    );
                }
            }
        }
    }

    async fn try_once(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        let started = Instant::now();

        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Head => self.client.head(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some((user, password)) = &options.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }

        let mut body_bytes = 0;
        match &request.body {
            Some(RequestBody::Raw(data)) => {
                body_bytes = data.len();
                builder = builder.body(data.clone());
            }
            Some(RequestBody::Form(fields)) => {
                body_bytes = fields
                    .iter()
                    .map(|(name, value)| name.len() + value.len() + 2)
                    .sum();
                builder = builder.form(fields);
            }
            None => (),
        }

        if !request.files.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for (field, path) in &request.files {
                let contents = match tokio::fs::read(path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        return Err(TransportError::new(
                            format!("failed to read attachment {}: {}", path, e),
                            &request.url,
                        ));
                    }
                };
                body_bytes += contents.len();
                let file_name = path
                    .rsplit('/')
                    .next()
                    .unwrap_or(path.as_str())
                    .to_string();
                form = form.part(
                    field.clone(),
                    reqwest::multipart::Part::bytes(contents).file_name(file_name),
                );
            }
            builder = builder.multipart(form);
        }

        let bytes_sent = estimate_request_bytes(request, body_bytes);
        let mut report = MetricReport::default();
        report.counters.insert(BYTES_SENT.to_string(), bytes_sent);

        // Request preparation (including attachment reads) counts as the
        // `send` phase; reqwest exposes no finer-grained socket timing.
        let send_ms = elapsed_ms(started);
        report.phases.insert("send".to_string(), send_ms);

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let total_ms = elapsed_ms(started);
                report.phases.insert("total".to_string(), total_ms);
                report.error = Some(e.to_string());
                let mut error = TransportError::new(e.to_string(), &request.url);
                error.report = Some(report);
                return Err(error);
            }
        };

        let wait_ms = elapsed_ms(started) - send_ms;
        report.phases.insert("wait".to_string(), wait_ms);

        let status = response.status();
        let status_text = status
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(e) => {
                let total_ms = elapsed_ms(started);
                report.phases.insert("total".to_string(), total_ms);
                report.status = status.as_u16();
                report.status_text = status_text;
                report.error = Some(e.to_string());
                let mut error = TransportError::new(e.to_string(), &request.url);
                error.headers = Some(headers);
                error.report = Some(report);
                return Err(error);
            }
        };

        let total_ms = elapsed_ms(started);
        report
            .phases
            .insert("receive".to_string(), total_ms - send_ms - wait_ms);
        report.phases.insert("total".to_string(), total_ms);
        report.status = status.as_u16();
        report.status_text = status_text.clone();
        report
            .counters
            .insert(BYTES_RECEIVED.to_string(), body.len() as u64);

        // Treat any non-2xx response as an error, carrying the response for
        // diagnostics.
        if !status.is_success() {
            let message = format!("HTTP {} {}", status.as_u16(), status_text);
            report.error = Some(message.clone());
            let mut error = TransportError::new(message, &request.url);
            error.headers = Some(headers);
            error.body = Some(String::from_utf8_lossy(&body).into_owned());
            error.report = Some(report);
            return Err(error);
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text,
            headers,
            body,
            report,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(request, options).await
    }

    async fn post(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(request, options).await
    }

    async fn head(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(request, options).await
    }

    async fn put(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(request, options).await
    }

    async fn delete(
        &self,
        request: &ResolvedRequest,
        options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.execute(request, options).await
    }
}

// Milliseconds elapsed since `started`, with sub-millisecond precision.
fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

// Approximate the serialized size of the request line, headers and body.
// The transport has no access to the raw socket, so byte counters are an
// estimate rather than an exact wire count.
fn estimate_request_bytes(request: &ResolvedRequest, body_bytes: usize) -> u64 {
    // "METHOD <url> HTTP/1.1\r\n"
    let mut bytes = request.method.as_str().len() + request.url.len() + 12;
    for (name, value) in &request.headers {
        // "Name: Value\r\n"
        bytes += name.len() + value.len() + 4;
    }
    (bytes + body_bytes) as u64
}
