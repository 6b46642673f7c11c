use gumdrop::Options;
use httpmock::MockServer;
use std::fs::File;
use std::io::{BufRead, BufReader};

use kestrel::config::KestrelConfiguration;
use kestrel::{LoadTest, RunReport};

/// Not all functions are used by all tests, so we enable allow(dead_code) to
/// avoid compiler warnings during testing.

/// The following options are configured by default, if not set to a custom
/// value:
///  --max 10
///  --threads 2
///  --timeout 5
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> KestrelConfiguration {
    let server_url = server.url("/");
    build_configuration_with_target(&server_url, custom)
}

/// Same defaults as [`build_configuration`], but with an explicit target,
/// for tests exercising URL templates.
#[allow(dead_code)]
pub fn build_configuration_with_target(
    target: &str,
    custom: Vec<&str>,
) -> KestrelConfiguration {
    // The free argument (the target) comes first, then any custom options.
    let mut configuration: Vec<&str> = vec![target];
    configuration.extend_from_slice(&custom);

    // Default to 10 requests if not otherwise configured.
    if !configuration.contains(&"--max") {
        configuration.extend_from_slice(&["--max", "10"]);
    }

    // Default to 2 workers if not otherwise configured.
    if !configuration.contains(&"--threads") {
        configuration.extend_from_slice(&["--threads", "2"]);
    }

    // Default to a 5 second timeout if not otherwise configured.
    if !configuration.contains(&"--timeout") {
        configuration.extend_from_slice(&["--timeout", "5"]);
    }

    // Parse these options to generate a KestrelConfiguration.
    KestrelConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run the actual load test, returning the final RunReport.
#[allow(dead_code)]
pub fn run_load_test(configuration: KestrelConfiguration) -> RunReport {
    LoadTest::initialize_with_config(configuration)
        .expect("failed to initialize the load test")
        .execute()
        .expect("failed to execute the load test")
}

/// Count how many lines are in a file, 0 when it does not exist.
#[allow(dead_code)]
pub fn file_length(file: &str) -> usize {
    match File::open(file) {
        Ok(f) => BufReader::new(f).lines().count(),
        Err(_) => 0,
    }
}

/// Remove a test artifact left behind by an earlier run, if any.
#[allow(dead_code)]
pub fn cleanup_file(file: &str) {
    let _ = std::fs::remove_file(file);
}
