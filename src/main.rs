//! # Netmark - Main Entry Point
//!
//! The same binary serves both roles of the benchmark: started with
//! `--listen` it becomes the server and answers test requests until a client
//! sends `quit`; started with a host and a list of test names it becomes the
//! client, runs each test against the server, and prints the results.
//!
//! The work done here is deliberately thin:
//! 1. **Initialize logging**: a clean colorized stdout layer for the user
//!    plus a detailed file (or stderr) layer for diagnostics
//! 2. **Parse arguments** and answer `--show-param` queries locally
//! 3. **Install the duration alarm handler**, once, before any test runs
//! 4. **Dispatch** into the client or server loop in the registry

use anyhow::Result;
use clap::Parser;
use netmark::cli::Args;
use netmark::{clock, registry};
use tracing::{error, info};

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ConsoleFormatter;

fn main() {
    if let Err(e) = run() {
        // One line on stderr, non-zero exit: the contract for scripts
        // wrapping the benchmark.
        eprintln!("netmark: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    // Logging level for both the detailed layer and stdout:
    // default INFO, -v DEBUG, -vv and more TRACE.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // The detailed layer goes to stderr on request, or to a rolling file.
    // The guard must stay alive for the duration of the program or file
    // logging silently stops.
    let guard;
    let detailed_log_layer;
    match args.log_file.as_deref() {
        Some("stderr") => {
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
        Some(path_str) => {
            let log_path = std::path::Path::new(path_str);
            let log_dir = log_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("netmark.log"));
            let appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
        None => {
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::sink)
                .with_filter(LevelFilter::OFF)
                .boxed();
            guard = None;
        }
    }

    // Clean user-facing output on stdout unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ConsoleFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    // --show-param answers from the locally assembled table and exits.
    if !args.show_param.is_empty() {
        let table = args.to_param_table()?;
        for name in &args.show_param {
            info!("{}", table.show(name)?);
        }
        return Ok(());
    }

    // The duration alarm is process-wide state; install its handler before
    // the first test arms it.
    clock::install_alarm_handler()?;

    if args.listen {
        registry::run_server(&args.to_server_config())
    } else {
        let cfg = args.to_client_config()?;
        let outcome = registry::run_client(&cfg);
        if outcome.is_err() {
            error!("benchmark aborted");
        }
        outcome
    }
}
