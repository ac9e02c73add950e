//! Test run sequencing.
//!
//! Start the server under test, wait for it to accept connections, send
//! every sample message on its own connection, then stop the server and
//! print what it wrote. Teardown runs no matter how the exchanges went,
//! and also when the run is interrupted with ctrl-c or SIGTERM.

use crate::client::{Client, ExchangeResult};
use crate::config::Config;
use crate::readiness::{self, Backoff, Readiness};
use crate::samples::Sample;
use crate::shutdown;
use crate::supervisor::{self, CapturedOutput, SupervisedProcess};
use std::future::Future;
use tracing::{error, info, warn};

/// How one message fared
#[derive(Debug, Clone)]
pub struct MessageOutcome {
    pub name: String,
    /// `ExchangeResult::category`, or `aborted` if the exchange task died
    pub category: &'static str,
    /// Decoded response for complete frames, otherwise a description
    pub detail: String,
}

/// Everything a run observed
#[derive(Debug, Default)]
pub struct RunReport {
    /// Why the server could not be started, if it could not
    pub startup_error: Option<String>,
    pub readiness: Option<Readiness>,
    pub outcomes: Vec<MessageOutcome>,
    /// Stopped early by ctrl-c or SIGTERM
    pub interrupted: bool,
    pub server: Option<CapturedOutput>,
    /// Why teardown failed, if it did
    pub teardown_error: Option<String>,
}

/// Run the whole sequence against `config`'s target
pub async fn run(config: &Config, messages: &[Sample]) -> RunReport {
    run_until(config, messages, shutdown::requested()).await
}

/// Run the sequence, cutting readiness and exchanges short once `interrupt`
/// resolves. The server is torn down either way.
pub async fn run_until<F>(config: &Config, messages: &[Sample], interrupt: F) -> RunReport
where
    F: Future<Output = ()>,
{
    let mut report = RunReport::default();

    let mut process = match &config.launch {
        Some(launch) => {
            println!("Starting MLLP server...");
            match supervisor::start(&launch.command, &launch.args) {
                Ok(process) => Some(process),
                Err(e) => {
                    error!(error = %e, "Server did not start");
                    println!("Failed to start server: {e}");
                    report.startup_error = Some(e.to_string());
                    None
                }
            }
        }
        None => None,
    };

    let interrupted = tokio::select! {
        _ = exercise(config, messages, &mut process, &mut report) => false,
        _ = interrupt => true,
    };
    if interrupted {
        warn!(
            completed = report.outcomes.len(),
            "Run interrupted, stopping server"
        );
        println!("Interrupted.");
        report.interrupted = true;
    }

    if let Some(process) = process.as_mut() {
        teardown(config, process, &mut report).await;
    }

    report
}

/// Readiness then exchanges, recording into `report` as it goes
async fn exercise(
    config: &Config,
    messages: &[Sample],
    process: &mut Option<SupervisedProcess>,
    report: &mut RunReport,
) {
    if process.is_some() {
        report.readiness = Some(wait_until_ready(config, process).await);
    }

    exchange_all(config, messages, &mut report.outcomes).await;
}

async fn wait_until_ready(config: &Config, process: &mut Option<SupervisedProcess>) -> Readiness {
    if !config.startup_delay.is_zero() {
        tokio::time::sleep(config.startup_delay).await;
    }

    let target = config.target();
    let readiness = readiness::wait_for_listener(
        &target,
        config.readiness_timeout,
        Backoff::default(),
        || process.as_mut().map_or(true, |p| !p.has_exited()),
    )
    .await;

    match readiness {
        Readiness::Ready { attempts } => info!(%target, attempts, "Server is ready"),
        Readiness::TimedOut { attempts } => {
            warn!(%target, attempts, "Server not accepting connections, continuing anyway")
        }
        Readiness::Abandoned { attempts } => {
            warn!(%target, attempts, "Server exited before accepting connections")
        }
    }
    readiness
}

/// Send every message in order; no failure stops the sequence
async fn exchange_all(config: &Config, messages: &[Sample], outcomes: &mut Vec<MessageOutcome>) {
    let client = Client::new(config.host.clone(), config.port, config.read_timeout)
        .with_max_response_bytes(config.max_response_bytes);

    for sample in messages {
        println!(
            "Connecting to MLLP server at {}:{}...",
            config.host, config.port
        );
        println!("Sending {} message...", sample.name);

        // Own task, so a panic is reported for this message only
        let task_client = client.clone();
        let payload = sample.payload;
        let outcome = match tokio::spawn(async move { task_client.exchange(payload).await }).await
        {
            Ok(result) => describe(sample.name, &result),
            Err(e) => {
                error!(message = sample.name, error = %e, "Exchange task failed");
                MessageOutcome {
                    name: sample.name.to_string(),
                    category: "aborted",
                    detail: e.to_string(),
                }
            }
        };

        println!("[{}] {}: {}", outcome.category, outcome.name, outcome.detail);
        outcomes.push(outcome);
    }

    println!("Test completed.");
}

/// Turn a result into its report line
fn describe(name: &str, result: &ExchangeResult) -> MessageOutcome {
    let detail = match result {
        ExchangeResult::Complete { payload } => match result.text() {
            Some(Ok(text)) => text.replace('\r', "\n"),
            _ => {
                warn!(message = name, "Response payload is not valid UTF-8");
                String::from_utf8_lossy(payload).replace('\r', "\n")
            }
        },
        ExchangeResult::Malformed { raw } => {
            format!("Invalid MLLP frame in response: {:?}", String::from_utf8_lossy(raw))
        }
        ExchangeResult::ConnectionFailure { cause }
            if cause.kind() == std::io::ErrorKind::ConnectionRefused =>
        {
            "Connection refused. Is the server running?".to_string()
        }
        other => other.to_string(),
    };

    info!(message = name, category = result.category(), "Exchange finished");
    MessageOutcome {
        name: name.to_string(),
        category: result.category(),
        detail,
    }
}

async fn teardown(config: &Config, process: &mut SupervisedProcess, report: &mut RunReport) {
    println!("Stopping server...");
    match process.stop(config.grace_period, config.drain_timeout).await {
        Ok(output) => {
            print_diagnostics(&output);
            report.server = Some(output);
        }
        Err(e) => {
            error!(error = %e, "Server teardown failed");
            println!("Failed to stop server: {e}");
            report.teardown_error = Some(e.to_string());
        }
    }
}

fn print_diagnostics(output: &CapturedOutput) {
    match output.status {
        Some(status) => println!("Server {:?} ({status})", output.state),
        None => println!("Server {:?}", output.state),
    }

    println!("Server output:");
    println!("{}", output.stdout_lossy());

    if !output.stderr.is_empty() {
        println!("Server errors:");
        println!("{}", output.stderr_lossy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchSpec;
    use crate::samples;
    use crate::server::Server;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(port: u16, launch: Option<LaunchSpec>) -> Config {
        Config {
            mode: None,
            host: "127.0.0.1".to_string(),
            port,
            launch,
            listen: format!("127.0.0.1:{port}"),
            startup_delay: Duration::ZERO,
            readiness_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(2),
            drain_timeout: Duration::from_millis(500),
            max_response_bytes: 1024 * 1024,
            log_level: "info".to_string(),
        }
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn run(config: &Config, messages: &[Sample]) -> RunReport {
        run_until(config, messages, std::future::pending()).await
    }

    fn sh(script: &str) -> Option<LaunchSpec> {
        Some(LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
    }

    #[tokio::test]
    async fn test_corpus_against_running_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let _ = Server::new("in-process")
                .serve(listener, std::future::pending())
                .await;
        });

        let report = run(&config(port, None), &samples::corpus()).await;
        server.abort();

        assert_eq!(report.outcomes.len(), 4);
        assert!(report.outcomes.iter().all(|o| o.category == "complete"));
        assert!(report.outcomes[0].detail.starts_with("MSH|"));
        assert!(report.outcomes[0].detail.contains("ADT^A01"));
        // The corrupted message is still sent and answered with a rejection
        assert!(report.outcomes[3].detail.contains("MSA|AR|MSG00004|"));
        assert!(report.server.is_none());
        assert!(report.readiness.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_never_listens() {
        let port = unused_port().await;
        let report = run(
            &config(port, sh("echo booting; exec sleep 30")),
            &samples::corpus(),
        )
        .await;

        assert!(matches!(report.readiness, Some(Readiness::TimedOut { .. })));
        assert_eq!(report.outcomes.len(), 4);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.category == "connection-failure"));

        let server = report.server.expect("teardown ran");
        assert_eq!(server.state, supervisor::TerminationState::GracefullyStopped);
        assert_eq!(server.stdout_lossy(), "booting\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_exits_during_startup() {
        let port = unused_port().await;
        let report = run(
            &config(port, sh("echo 'bind failed' >&2; exit 3")),
            &samples::corpus()[..1],
        )
        .await;

        assert!(matches!(report.readiness, Some(Readiness::Abandoned { .. })));
        assert_eq!(report.outcomes[0].category, "connection-failure");

        let server = report.server.expect("teardown ran");
        assert_eq!(server.state, supervisor::TerminationState::Exited);
        assert_eq!(server.status.and_then(|s| s.code()), Some(3));
        assert_eq!(server.stderr_lossy(), "bind failed\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_still_runs_exchanges() {
        let port = unused_port().await;
        let launch = Some(LaunchSpec {
            command: "/nonexistent/mllp-server".to_string(),
            args: vec!["server".to_string()],
        });
        let report = run(&config(port, launch), &samples::corpus()[..2]).await;

        assert!(report.startup_error.is_some());
        assert!(report.readiness.is_none());
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.server.is_none());
    }

    #[test]
    fn test_describe_categories() {
        let refused = ExchangeResult::ConnectionFailure {
            cause: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        let outcome = describe("ADT^A01", &refused);
        assert_eq!(outcome.category, "connection-failure");
        assert!(outcome.detail.contains("Connection refused"));

        let malformed = ExchangeResult::Malformed {
            raw: bytes::Bytes::from_static(b"oops"),
        };
        let outcome = describe("ADT^A01", &malformed);
        assert_eq!(outcome.category, "malformed-frame");
        assert!(outcome.detail.contains("oops"));

        assert_eq!(describe("x", &ExchangeResult::NoResponse).category, "no-response");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupt_stops_server() {
        let port = unused_port().await;
        let mut config = config(port, sh("echo up; exec sleep 30"));
        config.readiness_timeout = Duration::from_secs(20);

        let started = std::time::Instant::now();
        let report = run_until(
            &config,
            &samples::corpus(),
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await;

        assert!(report.interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        // Cut short while still waiting for the listener
        assert!(report.readiness.is_none());
        assert!(report.outcomes.is_empty());

        let server = report.server.expect("teardown ran");
        assert_eq!(server.state, supervisor::TerminationState::GracefullyStopped);
        assert_eq!(server.stdout_lossy(), "up\n");
    }

    #[tokio::test]
    async fn test_uninterrupted_run_is_not_flagged() {
        let port = unused_port().await;
        let report = run(&config(port, None), &samples::corpus()[..1]).await;
        assert!(!report.interrupted);
        assert_eq!(report.outcomes[0].category, "connection-failure");
    }
}
