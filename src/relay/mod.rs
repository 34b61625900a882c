//! Data Relay Module
//!
//! Handles bidirectional data relay between a client and the upstream.

pub mod copier;
pub mod pair;
pub mod session;

pub use copier::{StreamCopier, DEFAULT_CHUNK_SIZE};
pub use pair::{ConnectionPair, PairOptions};
pub use session::{DirectionOutcome, RelaySession, SessionEnd, SessionPeers, SessionSummary};
