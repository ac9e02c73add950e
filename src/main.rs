//! mllp-probe: An MLLP endpoint probe
//!
//! Validates an HL7 transport endpoint speaking the Minimal Lower Layer
//! Protocol:
//! - Starts the server under test as a supervised child process
//! - Waits for it to accept TCP connections
//! - Sends a fixed corpus of HL7 messages, one connection each
//! - Stops the server (SIGTERM, then SIGKILL) and prints what it wrote
//!
//! The `server` subcommand runs a bundled MLLP echo server, which is also
//! what the probe launches by default.

mod client;
mod config;
mod mllp;
mod orchestrator;
mod readiness;
mod samples;
mod server;
mod shutdown;
mod supervisor;

use config::{Config, Mode};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.mode.clone() {
        Some(Mode::Server { .. }) => runtime.block_on(run_server(config)),
        None => runtime.block_on(run_probe(config)),
    }
}

/// Run the bundled MLLP server until it is told to stop
async fn run_server(config: Config) -> Result<(), BoxError> {
    info!(listen = %config.listen, "Starting mllp-probe server");
    Server::new(config.listen).run().await
}

/// Run the probe sequence against the configured target
async fn run_probe(config: Config) -> Result<(), BoxError> {
    info!(
        endpoint = %config.target(),
        spawn = config.launch.is_some(),
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        grace_period_ms = config.grace_period.as_millis() as u64,
        "Starting mllp-probe run"
    );

    let report = orchestrator::run(&config, &samples::corpus()).await;

    // Failures are reported, not turned into an exit code
    let failed = report
        .outcomes
        .iter()
        .filter(|o| o.category != "complete")
        .count();
    info!(
        messages = report.outcomes.len(),
        failed,
        server_started = report.startup_error.is_none(),
        readiness = ?report.readiness,
        interrupted = report.interrupted,
        output_captured = report.server.is_some(),
        teardown_ok = report.teardown_error.is_none(),
        "Run finished"
    );
    Ok(())
}
