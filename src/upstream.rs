//! Upstream Endpoint and Dialer

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Fixed upstream target, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("endpoint '{}' must be host:port", s))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            bail!("endpoint '{}' has an empty host", s);
        }
        if host.contains(':') && !s.starts_with('[') {
            bail!("IPv6 endpoint '{}' must be written as [addr]:port", s);
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow!("endpoint '{}' has an invalid port", s))?;
        if port == 0 {
            bail!("endpoint '{}' must not use port 0", s);
        }

        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Shared backoff applied to dials after consecutive failures
#[derive(Debug)]
pub struct DialBackoff {
    max: Duration,
    consecutive_failures: AtomicU32,
}

impl DialBackoff {
    const BASE: Duration = Duration::from_millis(100);

    /// `max` of zero disables backoff
    pub fn new(max: Duration) -> Self {
        Self {
            max,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.max.is_zero()
    }

    /// Delay to wait before the next dial
    pub fn delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if !self.is_enabled() || failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(16);
        Self::BASE.saturating_mul(factor).min(self.max)
    }

    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// Dials the fixed upstream endpoint for every session
#[derive(Debug)]
pub struct Dialer {
    endpoint: Endpoint,
    connect_timeout: Duration,
    backoff: DialBackoff,
}

impl Dialer {
    pub fn new(endpoint: Endpoint, connect_timeout: Duration, max_backoff: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            backoff: DialBackoff::new(max_backoff),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect to the upstream; resolution and every candidate address share one timeout
    pub async fn dial(&self) -> Result<(TcpStream, SocketAddr), RelayError> {
        let delay = self.backoff.delay();
        if !delay.is_zero() {
            debug!(
                "Delaying dial to {} by {:?} after {} failures",
                self.endpoint,
                delay,
                self.backoff.consecutive_failures()
            );
            tokio::time::sleep(delay).await;
        }

        let result = match timeout(self.connect_timeout, self.try_dial()).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {:?}", self.connect_timeout)),
        };

        match result {
            Ok((stream, addr)) => {
                self.backoff.record_success();
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on upstream {}: {}", addr, e);
                }
                Ok((stream, addr))
            }
            Err(cause) => {
                let failures = self.backoff.record_failure();
                warn!("Dial to {} failed ({} in a row): {}", self.endpoint, failures, cause);
                Err(RelayError::DialFailed {
                    endpoint: self.endpoint.to_string(),
                    cause,
                })
            }
        }
    }

    async fn try_dial(&self) -> Result<(TcpStream, SocketAddr), String> {
        let addrs: Vec<SocketAddr> = lookup_host((self.endpoint.host.as_str(), self.endpoint.port))
            .await
            .map_err(|e| format!("resolution failed: {}", e))?
            .collect();

        if addrs.is_empty() {
            return Err("resolution returned no addresses".to_string());
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("Connected to upstream {} ({})", self.endpoint, addr);
                    return Ok((stream, addr));
                }
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(format!("{}: {}", addr, e));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| "no addresses tried".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_parsing() {
        let ep: Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(ep, Endpoint::new("example.com", 443));
        assert_eq!(ep.to_string(), "example.com:443");

        let ep: Endpoint = "[::1]:8080".parse().unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.to_string(), "[::1]:8080");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:0".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
        assert!("::1:80".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_backoff_growth_and_reset() {
        let backoff = DialBackoff::new(Duration::from_millis(500));
        assert_eq!(backoff.delay(), Duration::ZERO);

        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::from_millis(100));
        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::from_millis(200));
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::from_millis(500));

        backoff.record_success();
        assert_eq!(backoff.delay(), Duration::ZERO);
    }

    #[test]
    fn test_disabled_backoff() {
        let backoff = DialBackoff::new(Duration::ZERO);
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = Dialer::new(addr.into(), Duration::from_secs(2), Duration::ZERO);
        let (_, connected) = dialer.dial().await.unwrap();
        assert_eq!(connected, addr);
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::new(addr.into(), Duration::from_secs(2), Duration::from_secs(1));
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, RelayError::DialFailed { .. }));
        assert_eq!(dialer.backoff.consecutive_failures(), 1);
    }
}
