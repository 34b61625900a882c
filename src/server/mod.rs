//! Relay Server Module
//!
//! Owns the listening socket, admission control and the supervised
//! per-session tasks.

pub mod acceptor;
pub mod admission;
pub mod manager;

pub use acceptor::Acceptor;
pub use admission::{Admission, AdmissionStats, SessionSlot};
pub use manager::{RelayServer, ServerExit, ServerHandle, ServerState};
