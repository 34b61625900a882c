//! Trampoline - TCP relay with traffic observation

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trampoline::config::{CliOverrides, Config, ConfigManager};
use trampoline::sink::{ByteSink, DetachedSink, TeeSink, TracingSink, TranscriptSink};
use trampoline::{RelayServer, ShutdownCoordinator};

/// CLI arguments for Trampoline
#[derive(Parser, Debug)]
#[command(name = "trampoline")]
#[command(about = "Trampoline - TCP relay with traffic observation")]
#[command(version)]
#[command(long_about = "
Trampoline - TCP relay with traffic observation

Accepts connections on LISTEN and relays each one to UPSTREAM, reporting
the bytes seen in both directions.

  trampoline 9000 localhost:8080
  trampoline 9000 localhost 8080

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  TRAMPOLINE_LISTEN_ADDR     - Listen port or address (e.g., 9000, 127.0.0.1:9000)
  TRAMPOLINE_UPSTREAM        - Upstream endpoint (host:port)
  TRAMPOLINE_MAX_SESSIONS    - Maximum concurrent sessions (0 = unbounded)
  TRAMPOLINE_CONNECT_TIMEOUT - Upstream connect timeout (e.g., 5s)
  TRAMPOLINE_IDLE_TIMEOUT    - Session idle timeout (e.g., 5m)
  TRAMPOLINE_CHUNK_SIZE      - Copy chunk size in bytes
  TRAMPOLINE_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Port or address to listen on
    #[arg(value_name = "LISTEN")]
    pub listen: Option<String>,

    /// Upstream endpoint as host:port, or just the host when PORT follows
    #[arg(value_name = "UPSTREAM")]
    pub upstream: Option<String>,

    /// Upstream port for the `listenport host port` form
    #[arg(value_name = "PORT")]
    pub upstream_port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, default_value = "trampoline.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Maximum number of concurrent sessions (0 = unbounded)
    #[arg(long, help = "Maximum number of concurrent sessions")]
    pub max_sessions: Option<usize>,

    /// Close connections beyond the session limit instead of queueing them
    #[arg(long, help = "Reject connections beyond the session limit")]
    pub reject_when_full: bool,

    #[arg(
        long,
        value_parser = humantime::parse_duration,
        help = "Upstream connect timeout (e.g., 5s)"
    )]
    pub connect_timeout: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, help = "Session idle timeout (e.g., 5m)")]
    pub idle_timeout: Option<Duration>,

    #[arg(long, help = "Copy chunk size in bytes")]
    pub chunk_size: Option<usize>,

    /// Append a text transcript of all traffic to this file
    #[arg(long, help = "Write a traffic transcript to this file")]
    pub transcript: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        let upstream = match (&self.upstream, self.upstream_port) {
            (Some(host), Some(port)) if host.contains(':') && !host.starts_with('[') => {
                Some(format!("[{}]:{}", host, port))
            }
            (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
            (upstream, None) => upstream.clone(),
            (None, Some(_)) => None,
        };

        CliOverrides {
            listen: self.listen.clone(),
            upstream,
            max_sessions: self.max_sessions,
            reject_when_full: self.reject_when_full,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            chunk_size: self.chunk_size,
            transcript: self.transcript.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("trampoline: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_tracing(&args, &config) {
        eprintln!("trampoline: failed to initialize logging: {:#}", e);
        return ExitCode::from(2);
    }

    if args.validate_config {
        info!("Configuration is valid");
        log_config_summary(&config);
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Load configuration with priority: CLI args > config file > environment > defaults
fn load_config(args: &CliArgs) -> Result<Config> {
    load_config_with_vars(args, |name| std::env::var(name).ok())
}

fn load_config_with_vars<F>(args: &CliArgs, var: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    if args.upstream_port.is_some() && args.upstream.is_none() {
        bail!("upstream port given without an upstream host");
    }

    let mut config = ConfigManager::load_with_vars(&args.config, var)?;

    config.merge_with_cli_args(&args.overrides())?;

    config.validate().context("Final configuration validation failed")?;

    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    info!("Starting Trampoline v{}", env!("CARGO_PKG_VERSION"));
    log_config_summary(&config);

    let (sink, detached) = build_sink(&config)?;
    let config = Arc::new(config);
    let shutdown_coordinator =
        Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));

    let (server, server_task) = RelayServer::start(Arc::clone(&config), sink).await?;
    info!("Trampoline listening on {}", server.local_addr());
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let stopper = shutdown_coordinator.stop_on_shutdown(server.clone());
    let signal_listener = {
        let coordinator = Arc::clone(&shutdown_coordinator);
        tokio::spawn(async move {
            if let Err(e) = coordinator.listen_for_signals().await {
                error!("Error setting up signal handlers: {}", e);
            }
        })
    };

    stopper.await;
    signal_listener.abort();

    let state = shutdown_coordinator.wait_for_completion(&server).await?;
    info!("Relay server reached {:?}", state);
    let outcome = server_task.await.context("Relay server task failed")?;

    if let Some(detached) = detached {
        detached.close().await;
        if detached.dropped() > 0 {
            warn!("{} sink records were dropped under load", detached.dropped());
        }
    }

    let exit = outcome?;
    if exit.force_closed > 0 {
        warn!("{} sessions were force-closed during shutdown", exit.force_closed);
    }
    info!("Server shutdown complete after {} sessions", exit.sessions_served);
    Ok(())
}

/// Tracing sink, plus the transcript if configured, optionally behind a queue.
///
/// The queue is also returned so it can be drained before exit.
fn build_sink(config: &Config) -> Result<(Arc<dyn ByteSink>, Option<Arc<DetachedSink>>)> {
    let tracing_sink = TracingSink::new(config.sink.log_payload, config.sink.preview_bytes);

    let sink: Arc<dyn ByteSink> = match &config.sink.transcript {
        Some(path) => {
            let transcript = TranscriptSink::open(path)?;
            info!("Writing traffic transcript to {}", transcript.path().display());
            Arc::new(
                TeeSink::new()
                    .with(Arc::new(tracing_sink))
                    .with(Arc::new(transcript)),
            )
        }
        None => Arc::new(tracing_sink),
    };

    if config.sink.queue_capacity == 0 {
        return Ok((sink, None));
    }
    let detached = Arc::new(DetachedSink::new(sink, config.sink.queue_capacity)?);
    Ok((detached.clone(), Some(detached)))
}

fn log_config_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Listen address: {}", config.server.listen_addr);
    if let Some(endpoint) = &config.upstream.endpoint {
        info!("  Upstream: {}", endpoint);
    }
    match config.session_limit() {
        Some(limit) => info!(
            "  Max sessions: {} ({:?} when full)",
            limit, config.server.admission
        ),
        None => info!("  Max sessions: unbounded"),
    }
    info!("  Connect timeout: {:?}", config.upstream.connect_timeout);
    info!("  Idle timeout: {:?}", config.relay.idle_timeout);
    info!("  Chunk size: {} bytes", config.relay.chunk_size);
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, config: &Config) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_argument_form() {
        let args = CliArgs::parse_from(["trampoline", "9000", "localhost", "8080"]);
        let overrides = args.overrides();
        assert_eq!(overrides.listen.as_deref(), Some("9000"));
        assert_eq!(overrides.upstream.as_deref(), Some("localhost:8080"));
    }

    #[test]
    fn test_two_argument_form() {
        let args = CliArgs::parse_from([
            "trampoline",
            "127.0.0.1:9000",
            "[::1]:8080",
            "--reject-when-full",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.upstream.as_deref(), Some("[::1]:8080"));
        assert!(overrides.reject_when_full);
    }

    #[test]
    fn test_duration_options() {
        let args = CliArgs::parse_from([
            "trampoline",
            "--connect-timeout",
            "250ms",
            "--idle-timeout",
            "2m",
        ]);
        assert_eq!(args.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(args.idle_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_env_still_applies_when_config_file_exists() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[upstream]\nendpoint = \"127.0.0.1:8080\"\n")
            .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = CliArgs::parse_from(["trampoline", "-c", path.as_str()]);
        let config = load_config_with_vars(&args, |name| {
            (name == "TRAMPOLINE_MAX_SESSIONS").then(|| "7".to_string())
        })
        .unwrap();
        assert_eq!(config.server.max_sessions, 7);
        assert_eq!(
            config.upstream.endpoint.map(|e| e.to_string()),
            Some("127.0.0.1:8080".to_string())
        );

        // CLI beats both
        let args = CliArgs::parse_from(["trampoline", "-c", path.as_str(), "--max-sessions", "2"]);
        let config = load_config_with_vars(&args, |name| {
            (name == "TRAMPOLINE_MAX_SESSIONS").then(|| "7".to_string())
        })
        .unwrap();
        assert_eq!(config.server.max_sessions, 2);
    }
}
