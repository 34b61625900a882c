//! Configuration Manager

use super::{AdmissionPolicy, Config};
use crate::upstream::Endpoint;
use crate::Result;
use anyhow::{anyhow, bail, Context};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values given on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub max_sessions: Option<usize>,
    pub reject_when_full: bool,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub chunk_size: Option<usize>,
    pub transcript: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// Load configuration with priority: file > environment > defaults
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_with_vars(path, |name| std::env::var(name).ok())
    }

    /// Layer the keys present in the file at `path` over `TRAMPOLINE_*`
    /// variables looked up through `var`, over the defaults
    pub fn load_with_vars<F>(path: &Path, var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::load_from_vars(var)?;

        let Some(file) = Self::read_file_table(path)? else {
            return Ok(config);
        };
        let config = overlay(&config, file)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load configuration from file over the defaults
    pub fn load_from_file(path: &Path) -> Result<Config> {
        Self::load_with_vars(path, |_| None)
    }

    fn read_file_table(path: &Path) -> Result<Option<toml::Table>> {
        if !path.exists() {
            tracing::warn!(
                "Configuration file not found at {}, using environment and defaults",
                path.display()
            );
            return Ok(None);
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let table: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(Some(table))
    }

    /// Apply `TRAMPOLINE_*` variables looked up through `var` to the defaults
    pub fn load_from_vars<F>(var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(listen) = var("TRAMPOLINE_LISTEN_ADDR") {
            config.server.listen_addr = parse_listen_addr(&listen)
                .with_context(|| format!("Invalid TRAMPOLINE_LISTEN_ADDR: {}", listen))?;
        }

        if let Some(upstream) = var("TRAMPOLINE_UPSTREAM") {
            config.upstream.endpoint = Some(
                upstream
                    .parse::<Endpoint>()
                    .with_context(|| format!("Invalid TRAMPOLINE_UPSTREAM: {}", upstream))?,
            );
        }

        if let Some(max_sessions) = var("TRAMPOLINE_MAX_SESSIONS") {
            config.server.max_sessions = max_sessions
                .parse::<usize>()
                .with_context(|| format!("Invalid TRAMPOLINE_MAX_SESSIONS: {}", max_sessions))?;
        }

        if let Some(timeout) = var("TRAMPOLINE_CONNECT_TIMEOUT") {
            config.upstream.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TRAMPOLINE_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(timeout) = var("TRAMPOLINE_IDLE_TIMEOUT") {
            config.relay.idle_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid TRAMPOLINE_IDLE_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(chunk_size) = var("TRAMPOLINE_CHUNK_SIZE") {
            config.relay.chunk_size = chunk_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TRAMPOLINE_CHUNK_SIZE: {}", chunk_size))?;
        }

        if let Some(level) = var("TRAMPOLINE_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }
}

/// Replace the values of `base` with every key set in `file`
fn overlay(base: &Config, file: toml::Table) -> Result<Config> {
    let mut merged = match toml::Value::try_from(base)? {
        toml::Value::Table(table) => table,
        other => bail!("configuration serialized to a {} instead of a table", other.type_str()),
    };
    merge_tables(&mut merged, file);
    Ok(toml::Value::Table(merged).try_into()?)
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(nested) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, nested),
                _ => {
                    base.insert(key, toml::Value::Table(nested));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// Parse a listen address; a bare port binds every IPv4 interface
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr> {
    let value = value.trim();
    if let Ok(port) = value.parse::<u16>() {
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    value
        .parse::<SocketAddr>()
        .map_err(|_| anyhow!("'{}' is neither a port nor a socket address", value))
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_sessions > 100_000 {
            bail!("max_sessions cannot exceed 100,000 for safety");
        }

        if self.server.max_accept_failures == 0 {
            bail!("max_accept_failures must be greater than 0");
        }

        if self.server.accept_backoff > Duration::from_secs(1) {
            bail!("accept_backoff cannot exceed 1s");
        }

        if self.server.shutdown_timeout > Duration::from_secs(3600) {
            bail!("shutdown_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.endpoint.is_none() {
            bail!("upstream.endpoint is required (host:port)");
        }

        if self.upstream.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.upstream.connect_timeout > Duration::from_secs(3600) {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }

        if self.relay.chunk_size > 1_048_576 {
            bail!("chunk_size cannot exceed 1MB");
        }

        if let Some(idle) = self.relay.idle_timeout {
            if idle.is_zero() {
                bail!("idle_timeout must be greater than 0 when set");
            }
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) -> Result<()> {
        if let Some(listen) = &cli.listen {
            self.server.listen_addr = parse_listen_addr(listen)?;
            tracing::info!("CLI override: listen address set to {}", self.server.listen_addr);
        }

        if let Some(upstream) = &cli.upstream {
            let endpoint: Endpoint = upstream.parse()?;
            tracing::info!("CLI override: upstream set to {}", endpoint);
            self.upstream.endpoint = Some(endpoint);
        }

        if let Some(max_sessions) = cli.max_sessions {
            self.server.max_sessions = max_sessions;
            tracing::info!("CLI override: max sessions set to {}", max_sessions);
        }

        if cli.reject_when_full {
            self.server.admission = AdmissionPolicy::Reject;
            tracing::info!("CLI override: connections beyond the limit are rejected");
        }

        if let Some(timeout) = cli.connect_timeout {
            self.upstream.connect_timeout = timeout;
            tracing::info!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(timeout) = cli.idle_timeout {
            self.relay.idle_timeout = Some(timeout);
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(chunk_size) = cli.chunk_size {
            self.relay.chunk_size = chunk_size;
            tracing::info!("CLI override: chunk size set to {} bytes", chunk_size);
        }

        if let Some(path) = &cli.transcript {
            self.sink.transcript = Some(path.clone());
            tracing::info!("CLI override: transcript written to {}", path.display());
        }

        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }

        Ok(())
    }
}
