use async_trait::async_trait;
use httpmock::{Method::GET, MockServer};
use std::sync::Arc;

mod common;

use kestrel::client::{
    HttpTransport, TransportError, TransportOptions, TransportResponse,
};
use kestrel::metrics::MetricReport;
use kestrel::template::ResolvedRequest;
use kestrel::{LoadTest, RunStatus};

// Most tests in this file drive the scheduler against a live mock server;
// the fixed-timing test swaps in a scripted transport instead.

// A transport returning a canned 200 with exactly 50ms of total time.
struct ScriptedTransport;

impl ScriptedTransport {
    fn respond(&self) -> Result<TransportResponse, TransportError> {
        let mut report = MetricReport::default();
        report.status = 200;
        report.status_text = "OK".to_string();
        report.phases.insert("total".to_string(), 50.0);
        report.counters.insert("bytes_sent".to_string(), 20);
        report.counters.insert("bytes_received".to_string(), 10);
        Ok(TransportResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: std::collections::BTreeMap::new(),
            body: b"ok".to_vec(),
            report,
        })
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(
        &self,
        _request: &ResolvedRequest,
        _options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.respond()
    }

    async fn post(
        &self,
        _request: &ResolvedRequest,
        _options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.respond()
    }

    async fn head(
        &self,
        _request: &ResolvedRequest,
        _options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.respond()
    }

    async fn put(
        &self,
        _request: &ResolvedRequest,
        _options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.respond()
    }

    async fn delete(
        &self,
        _request: &ResolvedRequest,
        _options: &TransportOptions,
    ) -> Result<TransportResponse, TransportError> {
        self.respond()
    }
}

#[test]
fn scripted_transport_yields_exact_phase_stats() {
    // No server needed, the scripted transport never touches the network.
    let configuration = common::build_configuration_with_target(
        "http://localhost/",
        vec!["--max", "10", "--threads", "2"],
    );
    let report = LoadTest::initialize_with_config(configuration)
        .unwrap()
        .set_transport(Arc::new(ScriptedTransport))
        .execute()
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.stats.total_reqs, 10);
    assert_eq!(report.stats.total_errors, 0);
    assert_eq!(report.stats.bytes_sent, 200);
    assert_eq!(report.stats.bytes_received, 100);

    // Every iteration reported exactly 50ms, so min, average and max agree.
    let total = report.metrics.phases.get("total").expect("no total phase");
    assert_eq!(total.count, 10);
    assert!((total.min - 50.0).abs() < f64::EPSILON);
    assert!((total.max - 50.0).abs() < f64::EPSILON);
    assert!((total.avg() - 50.0).abs() < f64::EPSILON);

    // All ten land in the 50-100ms bucket.
    let counts = report.histograms.get("total").expect("no total histogram");
    assert_eq!(counts.get("50-100 ms"), Some(&10));
}

#[test]
fn dispatches_exactly_the_requested_iterations() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).body("hello");
    });

    let configuration =
        common::build_configuration(&server, vec!["--max", "10", "--threads", "2"]);
    let report = common::run_load_test(configuration);

    // Exactly 10 iterations were dispatched and completed.
    assert_eq!(index.hits(), 10);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.requested, 10);
    assert_eq!(report.completed, 10);
    assert_eq!(report.stats.total_reqs, 10);
    assert_eq!(report.stats.total_errors, 0);

    // Every completion carried timing for the total phase.
    let total = report.metrics.phases.get("total").expect("no total phase");
    assert_eq!(total.count, 10);
    assert!(total.min <= total.avg() && total.avg() <= total.max);

    // The histogram tracked every in-range completion.
    let counts = report.histograms.get("total").expect("no total histogram");
    let classified: u64 = counts.values().sum();
    assert_eq!(classified, 10);

    // The mock body was downloaded every time.
    assert!(report.stats.bytes_received >= 5 * 10);
    assert!(report.stats.bytes_sent > 0);
}

#[test]
fn zero_iterations_complete_immediately() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    let configuration = common::build_configuration(&server, vec!["--max", "0"]);
    let report = common::run_load_test(configuration);

    assert_eq!(index.hits(), 0);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.completed, 0);
    assert_eq!(report.stats.total_reqs, 0);
}

#[test]
fn extra_threads_never_add_iterations() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    // Far more workers than iterations: still exactly 3 requests.
    let configuration =
        common::build_configuration(&server, vec!["--max", "3", "--threads", "10"]);
    let report = common::run_load_test(configuration);

    assert_eq!(index.hits(), 3);
    assert_eq!(report.stats.total_reqs, 3);
    assert_eq!(report.status, RunStatus::Completed);
}

#[test]
fn url_template_draws_from_parameter_pools() {
    let server = MockServer::start();
    let user_a = server.mock(|when, then| {
        when.method(GET).path("/1").query_param("u", "a");
        then.status(200);
    });
    let user_b = server.mock(|when, then| {
        when.method(GET).path("/1").query_param("u", "b");
        then.status(200);
    });

    let params_file = std::env::temp_dir().join("kestrel-scheduler-params.json");
    std::fs::write(&params_file, r#"{"user": ["a", "b"]}"#).unwrap();

    let target = format!("{}?u=[user]", server.url("/[1-1]"));
    let configuration = common::build_configuration_with_target(
        &target,
        vec!["--max", "20", "--params", params_file.to_str().unwrap()],
    );
    let report = common::run_load_test(configuration);

    // The numeric range is degenerate so every request hit /1, and every
    // request carried one of the two pool values.
    assert_eq!(user_a.hits() + user_b.hits(), 20);
    assert_eq!(report.stats.total_reqs, 20);
    assert_eq!(report.stats.total_errors, 0);

    std::fs::remove_file(&params_file).unwrap();
}

#[test]
fn inline_header_directive_applies_per_request() {
    let server = MockServer::start();
    let with_header = server.mock(|when, then| {
        when.method(GET).path("/").header("X-Test", "foo");
        then.status(200);
    });

    let target = format!("{} [header:X-Test:foo]", server.url("/"));
    let configuration =
        common::build_configuration_with_target(&target, vec!["--max", "5"]);
    let report = common::run_load_test(configuration);

    assert_eq!(with_header.hits(), 5);
    assert_eq!(report.stats.total_errors, 0);
}

#[test]
fn post_form_sends_fields() {
    let server = MockServer::start();
    let form_post = server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/login")
            .body("login=a");
        then.status(200);
    });

    let target = server.url("/login");
    let configuration = common::build_configuration_with_target(
        &target,
        vec!["--max", "4", "--form", "login=a"],
    );
    let report = common::run_load_test(configuration);

    assert_eq!(form_post.hits(), 4);
    assert_eq!(report.stats.total_errors, 0);
}
