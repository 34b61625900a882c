//! Relay Error Types

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::sink::Direction;

/// Failure of one copier direction
#[derive(Error, Debug)]
#[error("copy {direction} failed while {stage}: {cause}")]
pub struct CopyError {
    pub direction: Direction,
    pub stage: CopyStage,
    #[source]
    pub cause: io::Error,
}

/// Which half of the copy loop failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    Read,
    Write,
}

impl std::fmt::Display for CopyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyStage::Read => write!(f, "reading"),
            CopyStage::Write => write!(f, "writing"),
        }
    }
}

/// Errors surfaced by the relay core
#[derive(Error, Debug)]
pub enum RelayError {
    /// Listener could not be bound; fatal to startup
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Upstream dial failed; fatal only to the session
    #[error("failed to dial upstream {endpoint}: {cause}")]
    DialFailed { endpoint: String, cause: String },

    /// One copier direction failed
    #[error(transparent)]
    Copy(#[from] CopyError),

    /// Admission control rejected the connection
    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    /// Observation sink returned an error or panicked
    #[error("sink failure: {0}")]
    Sink(String),

    /// Configuration unusable for starting the relay
    #[error("invalid relay configuration: {0}")]
    Config(String),

    /// Too many consecutive accept errors
    #[error("listener failed after {failures} consecutive accept errors: {source}")]
    ListenerFailed {
        failures: u32,
        #[source]
        source: io::Error,
    },
}
