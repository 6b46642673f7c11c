use httpmock::{Method::GET, MockServer};

mod common;

use kestrel::RunStatus;

// Load test configuration.
const THROTTLE_REQUESTS: usize = 5;
const MAX_REQUESTS: usize = 12;

#[test]
fn throttled_run_spreads_over_multiple_seconds() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    let configuration = common::build_configuration(
        &server,
        vec![
            "--max",
            "12",
            "--threads",
            "4",
            // Limit the maximum requests per second.
            "--throttle",
            "5",
        ],
    );
    let report = common::run_load_test(configuration);

    // All requests were still made, the throttle only slowed them down.
    assert_eq!(index.hits(), MAX_REQUESTS);
    assert_eq!(report.stats.total_reqs, MAX_REQUESTS as u64);
    assert_eq!(report.status, RunStatus::Completed);

    // Twelve admissions at five per second need at least two extra
    // wall-clock seconds beyond the one the run started in.
    assert!(
        report.stats.elapsed >= 1.0,
        "throttled run finished too quickly: {:.3}s",
        report.stats.elapsed
    );

    // The per-second cap held for observed completions. A boundary-crossing
    // iteration can push one second to 2x the cap, never beyond.
    assert!(report.stats.peak_sec <= (THROTTLE_REQUESTS * 2) as u64);
}

#[test]
fn disabled_throttle_does_not_slow_the_run() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    let configuration =
        common::build_configuration(&server, vec!["--max", "20", "--threads", "5"]);
    let report = common::run_load_test(configuration);

    assert_eq!(index.hits(), 20);
    assert_eq!(report.status, RunStatus::Completed);
    // Without a throttle, 20 requests against a local mock are fast.
    assert!(
        report.stats.elapsed < 5.0,
        "unthrottled run took too long: {:.3}s",
        report.stats.elapsed
    );
}
