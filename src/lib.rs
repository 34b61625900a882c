//! Trampoline Library
//!
//! A TCP relay that accepts client connections on a local port, forwards
//! each one to a fixed upstream endpoint, and lets an observer watch the
//! bytes flowing in both directions.

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod upstream;

pub use config::Config;
pub use error::{CopyError, RelayError};
pub use server::{RelayServer, ServerExit, ServerHandle, ServerState};
pub use shutdown::ShutdownCoordinator;
pub use sink::{ByteSink, Direction, SessionEventKind, SessionId};
pub use upstream::Endpoint;

/// Common error type for configuration and the binary
pub type Result<T> = anyhow::Result<T>;
