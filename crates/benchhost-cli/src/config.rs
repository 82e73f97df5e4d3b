//! Configuration file management for benchhost.
//!
//! Provides a TOML-based config file at `~/.config/benchhost/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use benchhost_core::HostConfig;

/// Env var selecting the default transport for `benchhost run`.
pub const TRANSPORT_ENV: &str = "BENCHHOST_TRANSPORT";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub timeouts: TimeoutsSection,
    pub run: RunSection,
}

/// All values in milliseconds. Missing keys fall through to the defaults.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub process_exit_ms: Option<u64>,
    pub stream_settle_ms: Option<u64>,
    pub connect_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        let defaults = HostConfig::default();
        Self {
            process_exit_ms: Some(millis(defaults.process_exit_timeout)),
            stream_settle_ms: Some(millis(defaults.stream_settle_timeout)),
            connect_ms: Some(millis(defaults.connect_timeout)),
            poll_interval_ms: Some(millis(defaults.poll_interval)),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub transport: TransportKind,
}

/// How `benchhost run` talks to the worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Protocol over the worker's stdin/stdout.
    #[default]
    Pipe,
    /// Protocol over a local socket the worker connects back to.
    Channel,
}

impl TransportKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pipe" => Ok(Self::Pipe),
            "channel" => Ok(Self::Channel),
            other => bail!("unknown transport {other:?} (expected \"pipe\" or \"channel\")"),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the benchhost config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/benchhost` or
/// `~/.config/benchhost`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("benchhost");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("benchhost")
}

/// Return the path to the benchhost config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct BenchhostConfig {
    pub host: HostConfig,
    pub transport: TransportKind,
}

impl BenchhostConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Timeouts: `BENCHHOST_*_MS` env > `[timeouts]` in the config file > `HostConfig` defaults,
    ///   with `cli_exit_timeout` overriding the process exit timeout.
    /// - Transport: `cli_transport` > `BENCHHOST_TRANSPORT` env > `run.transport` > pipe
    pub fn resolve(
        cli_exit_timeout: Option<Duration>,
        cli_transport: Option<TransportKind>,
    ) -> Result<Self> {
        let file_config = load_config().ok();
        Self::resolve_with(file_config.as_ref(), cli_exit_timeout, cli_transport)
    }

    fn resolve_with(
        file_config: Option<&ConfigFile>,
        cli_exit_timeout: Option<Duration>,
        cli_transport: Option<TransportKind>,
    ) -> Result<Self> {
        let mut host = HostConfig::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_timeout(file_config, key).map(|ms| ms.to_string()))
        });
        if let Some(timeout) = cli_exit_timeout {
            host = host.with_process_exit_timeout(timeout);
        }

        let transport = if let Some(kind) = cli_transport {
            kind
        } else if let Ok(value) = std::env::var(TRANSPORT_ENV) {
            TransportKind::parse(&value)
                .with_context(|| format!("{TRANSPORT_ENV} env var is invalid"))?
        } else if let Some(cfg) = file_config {
            cfg.run.transport
        } else {
            TransportKind::default()
        };

        Ok(Self { host, transport })
    }
}

fn file_timeout(file_config: Option<&ConfigFile>, key: &str) -> Option<u64> {
    let timeouts = &file_config?.timeouts;
    match key {
        HostConfig::PROCESS_EXIT_TIMEOUT_ENV => timeouts.process_exit_ms,
        HostConfig::STREAM_SETTLE_TIMEOUT_ENV => timeouts.stream_settle_ms,
        HostConfig::CONNECT_TIMEOUT_ENV => timeouts.connect_ms,
        HostConfig::POLL_INTERVAL_ENV => timeouts.poll_interval_ms,
        _ => None,
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
