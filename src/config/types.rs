//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::upstream::Endpoint;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

/// What to do with a connection that arrives while all session slots are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Stop accepting until a session finishes
    Block,
    /// Accept and immediately close the connection
    Reject,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Maximum concurrent sessions; 0 means unbounded
    pub max_sessions: usize,
    pub admission: AdmissionPolicy,
    /// Grace period for active sessions on stop before they are force-closed
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub max_accept_failures: u32,
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
}

/// Upstream configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub endpoint: Option<Endpoint>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound of the dial backoff; zero disables it
    #[serde(with = "humantime_serde")]
    pub max_dial_backoff: Duration,
}

/// Per-session relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub chunk_size: usize,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

/// Observation sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    pub log_payload: bool,
    pub preview_bytes: usize,
    pub transcript: Option<PathBuf>,
    /// Queue length of the detached sink; 0 calls sinks inline
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Session limit, `None` when unbounded
    pub fn session_limit(&self) -> Option<usize> {
        match self.server.max_sessions {
            0 => None,
            n => Some(n),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            max_sessions: 0,
            admission: AdmissionPolicy::Block,
            shutdown_timeout: Duration::from_secs(30),
            max_accept_failures: 16,
            accept_backoff: Duration::from_millis(50),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout: Duration::from_secs(5),
            max_dial_backoff: Duration::ZERO,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::relay::DEFAULT_CHUNK_SIZE,
            idle_timeout: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            log_payload: true,
            preview_bytes: 256,
            transcript: None,
            queue_capacity: 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
