use httpmock::{Method::GET, MockServer};
use serial_test::serial;

mod common;

// Files written by these tests; serialized so parallel test binaries never
// race on them.
const WARNINGS_LOG: &str = "kestrel-warnings-test.log";
const STATS_LOG: &str = "kestrel-stats-test.log";

#[test]
#[serial]
fn warnings_log_records_each_slow_request() {
    common::cleanup_file(WARNINGS_LOG);

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200).delay(std::time::Duration::from_millis(150));
    });

    let configuration = common::build_configuration(
        &server,
        vec![
            "--max",
            "3",
            "--threads",
            "1",
            "--warn",
            "0.1",
            "--warnings-log",
            WARNINGS_LOG,
        ],
    );
    let report = common::run_load_test(configuration);

    assert_eq!(report.stats.total_warnings, 3);
    assert_eq!(common::file_length(WARNINGS_LOG), 3);

    // Each record is a JSON object carrying the request's metrics.
    let contents = std::fs::read_to_string(WARNINGS_LOG).unwrap();
    for line in contents.lines() {
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(record["req_num"].as_u64().unwrap() >= 1);
        assert_eq!(record["code"].as_u64().unwrap(), 200);
        assert!(record["metrics"]["phases"]["total"].as_f64().unwrap() >= 100.0);
    }

    common::cleanup_file(WARNINGS_LOG);
}

#[test]
#[serial]
fn stats_log_appends_one_record_per_run() {
    common::cleanup_file(STATS_LOG);

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    for _ in 0..2 {
        let configuration = common::build_configuration(
            &server,
            vec!["--max", "4", "--stats-log", STATS_LOG],
        );
        let report = common::run_load_test(configuration);
        assert_eq!(report.stats.total_reqs, 4);
    }

    // Two runs appended two records.
    assert_eq!(common::file_length(STATS_LOG), 2);

    let contents = std::fs::read_to_string(STATS_LOG).unwrap();
    for line in contents.lines() {
        let record: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(record["total_reqs"].as_u64().unwrap(), 4);
        assert_eq!(record["total_errors"].as_u64().unwrap(), 0);
    }

    common::cleanup_file(STATS_LOG);
}

#[test]
#[serial]
fn no_log_files_are_created_when_disabled() {
    common::cleanup_file(WARNINGS_LOG);
    common::cleanup_file(STATS_LOG);

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200);
    });

    let configuration = common::build_configuration(&server, vec!["--max", "2"]);
    let report = common::run_load_test(configuration);

    assert_eq!(report.stats.total_reqs, 2);
    assert_eq!(common::file_length(WARNINGS_LOG), 0);
    assert_eq!(common::file_length(STATS_LOG), 0);
}
