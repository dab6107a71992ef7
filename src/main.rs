//! sockstun binary entry point.
//!
//! Parses the CLI, initializes tracing (stderr plus a daily-rotating file
//! under `logs/`, distinct from the tailed redsocks log), loads and
//! validates the environment configuration, then hands control to the
//! orchestrator. An interrupt signal triggers the full shutdown protocol
//! exactly once, even when it arrives during startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;

use sockstun::cli::Cli;
use sockstun::config::load_environment_config;
use sockstun::console::{ConsoleReporter, Reporter};
use sockstun::orchestrator::Orchestrator;

fn main() {
    let cli = Cli::parse();
    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);

    let _log_guard = match init_tracing(cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&cli, Arc::clone(&reporter)) {
        reporter.error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn run(cli: &Cli, reporter: Arc<dyn Reporter>) -> Result<()> {
    debug!("Parsed CLI arguments: {cli:?}");

    reporter.header("Loading Configuration");
    let config = load_environment_config(cli.env_file.as_deref())?;

    let mut orchestrator =
        Orchestrator::new(config, cli.conflict_policy(), Arc::clone(&reporter), cli.headless);

    // Registered before startup so an interrupt arriving mid-startup still
    // funnels into the one guarded shutdown below.
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown_requested);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    orchestrator.start()?;

    reporter.info("System running. Press Ctrl+C to stop.");
    while !shutdown_requested.load(Ordering::SeqCst) && orchestrator.is_running() {
        std::thread::sleep(Duration::from_secs(1));
    }

    if shutdown_requested.load(Ordering::SeqCst) {
        reporter.warning("Interrupt received, shutting down...");
    }
    orchestrator.shutdown();
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// Console diagnostics go to stderr at the level selected by `-v`; a
/// parallel daily-rotating file under `logs/` keeps the structured record.
/// The returned guard must stay alive for the file writer to flush.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    std::fs::create_dir_all("logs").context("failed to create logs directory")?;
    let file_appender = tracing_appender::rolling::daily("logs", "sockstun.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(guard)
}
