//! The kestrel command-line binary: parse options, initialize logging, run
//! the load test, print the report.

use gumdrop::Options;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;

use kestrel::config::KestrelConfiguration;
use kestrel::{report, LoadTest, RunStatus};

fn main() {
    let configuration = KestrelConfiguration::parse_args_default_or_exit();

    if configuration.version {
        println!("kestrel {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    initialize_logger(&configuration);

    let load_test = match LoadTest::initialize_with_config(configuration) {
        Ok(load_test) => load_test,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    match load_test.execute() {
        Ok(run_report) => {
            println!("{}", report::format_report(&run_report));
            match run_report.status {
                RunStatus::Completed => (),
                RunStatus::StoppedFatalError | RunStatus::StoppedAborted => {
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    }
}

// Map the -v/-q counts onto the terminal logger and -g onto the optional log
// file, then install whichever loggers are enabled.
fn initialize_logger(configuration: &KestrelConfiguration) {
    let term_level = if configuration.quiet >= 2 {
        LevelFilter::Error
    } else if configuration.quiet == 1 {
        LevelFilter::Warn
    } else {
        match configuration.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        term_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));

    if !configuration.log_file.is_empty() {
        let file_level = match configuration.log_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        match File::create(&configuration.log_file) {
            Ok(file) => loggers.push(WriteLogger::new(file_level, Config::default(), file)),
            Err(e) => eprintln!(
                "WARNING: failed to create log file {}: {}",
                configuration.log_file, e
            ),
        }
    }

    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("WARNING: failed to initialize logger: {}", e);
    }
}
