//! Configuration module for mllp-probe.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the probe
#[derive(Parser, Debug)]
#[command(name = "mllp-probe")]
#[command(author = "mllp-probe authors")]
#[command(version = "0.1.0")]
#[command(about = "Drive HL7 messages over MLLP against a supervised server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host every exchange connects to
    #[arg(long)]
    pub host: Option<String>,

    /// Port every exchange connects to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Do not launch a server; probe one that is already running
    #[arg(long)]
    pub no_spawn: bool,

    /// Fixed delay after launching the server, in milliseconds
    #[arg(long)]
    pub startup_delay_ms: Option<u64>,

    /// Per-exchange connect and read timeout, in milliseconds
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// How long the server gets to exit after SIGTERM, in milliseconds
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

/// Alternate entry points
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run the bundled MLLP server in the foreground
    Server {
        /// Address to bind to (e.g., 127.0.0.1:2575)
        #[arg(short, long)]
        listen: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where exchanges are sent
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Server-under-test configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Program to launch (defaults to this executable)
    pub command: Option<String>,
    /// Arguments for `command` (defaults to `server --listen <host>:<port>`)
    pub args: Option<Vec<String>>,
    /// Whether to launch a server at all
    #[serde(default = "default_spawn")]
    pub spawn: bool,
    /// Bind address for the bundled server
    pub listen: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: None,
            spawn: default_spawn(),
            listen: None,
        }
    }
}

/// Timeouts and delays, all in milliseconds
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Client-side limits
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2575 // conventional MLLP port
}

fn default_spawn() -> bool {
    true
}

fn default_startup_delay_ms() -> u64 {
    0
}

fn default_readiness_timeout_ms() -> u64 {
    3000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_max_response_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How to launch the server under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Option<Mode>,
    pub host: String,
    pub port: u16,
    /// `None` when the server is already running elsewhere
    pub launch: Option<LaunchSpec>,
    pub listen: String,
    pub startup_delay: Duration,
    pub readiness_timeout: Duration,
    pub read_timeout: Duration,
    pub grace_period: Duration,
    pub drain_timeout: Duration,
    pub max_response_bytes: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let host = cli.host.unwrap_or(toml_config.target.host);
        let port = cli.port.unwrap_or(toml_config.target.port);
        let timing = toml_config.timing;

        let cli_listen = match &cli.mode {
            Some(Mode::Server { listen }) => listen.clone(),
            None => None,
        };
        let listen = cli_listen
            .or(toml_config.server.listen)
            .unwrap_or_else(|| format!("{host}:{port}"));

        let launch = if cli.no_spawn || !toml_config.server.spawn {
            None
        } else {
            Some(LaunchSpec {
                command: toml_config.server.command.unwrap_or_else(current_exe_name),
                args: toml_config.server.args.unwrap_or_else(|| {
                    vec!["server".to_string(), "--listen".to_string(), listen.clone()]
                }),
            })
        };

        Config {
            mode: cli.mode,
            host,
            port,
            launch,
            listen,
            startup_delay: Duration::from_millis(
                cli.startup_delay_ms.unwrap_or(timing.startup_delay_ms),
            ),
            readiness_timeout: Duration::from_millis(timing.readiness_timeout_ms),
            read_timeout: Duration::from_millis(
                cli.read_timeout_ms.unwrap_or(timing.read_timeout_ms),
            ),
            grace_period: Duration::from_millis(
                cli.grace_period_ms.unwrap_or(timing.grace_period_ms),
            ),
            drain_timeout: Duration::from_millis(timing.drain_timeout_ms),
            max_response_bytes: toml_config.client.max_response_bytes,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// `host:port` of the endpoint under test
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Path of the running executable, used as the default `<runner> server`
fn current_exe_name() -> String {
    std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "mllp-probe".to_string())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
}
