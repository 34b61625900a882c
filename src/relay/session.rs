//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::sink::{Direction, SessionId};

/// Addresses of the two peers of a session, when known
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionPeers {
    pub client: Option<SocketAddr>,
    pub upstream: Option<SocketAddr>,
}

/// Live counters of one relayed session, shared between its copiers
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: SessionId,
    pub peers: SessionPeers,
    start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    chunks_up: AtomicU64,
    chunks_down: AtomicU64,
    /// Milliseconds since `start_time` of the last forwarded chunk
    last_activity_ms: AtomicU64,
}

/// How one direction of a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "cause")]
pub enum DirectionOutcome {
    /// Source reached end-of-stream
    Completed,
    /// Read or write failed
    Failed(String),
    /// Copier was cancelled by an idle timeout or forced shutdown
    Aborted,
}

impl DirectionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DirectionOutcome::Completed)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Both copiers ran to completion
    Finished,
    IdleTimeout,
    ForceClosed,
}

/// Aggregate outcome of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub client_addr: Option<SocketAddr>,
    pub upstream_addr: Option<SocketAddr>,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub chunks_up: u64,
    pub chunks_down: u64,
    pub upstream_outcome: DirectionOutcome,
    pub downstream_outcome: DirectionOutcome,
    pub end: SessionEnd,
}

impl SessionSummary {
    /// Both directions completed without error
    pub fn is_clean(&self) -> bool {
        self.end == SessionEnd::Finished
            && self.upstream_outcome.is_completed()
            && self.downstream_outcome.is_completed()
    }

    /// Outcome of the given direction
    pub fn outcome(&self, direction: Direction) -> &DirectionOutcome {
        match direction {
            Direction::DownstreamToUpstream => &self.upstream_outcome,
            Direction::UpstreamToDownstream => &self.downstream_outcome,
        }
    }

    /// JSON rendering used as the detail of the summary event
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(session_id: SessionId, peers: SessionPeers) -> Self {
        debug!(
            "Creating new relay session: {} ({:?} -> {:?})",
            session_id, peers.client, peers.upstream
        );

        Self {
            session_id,
            peers,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            chunks_up: AtomicU64::new(0),
            chunks_down: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Get bytes transferred upstream (client to upstream)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (upstream to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Count a forwarded chunk and reset the idle clock
    pub fn record_chunk(&self, direction: Direction, len: usize) {
        let len = len as u64;
        match direction {
            Direction::DownstreamToUpstream => {
                self.bytes_up.fetch_add(len, Ordering::Relaxed);
                self.chunks_up.fetch_add(1, Ordering::Relaxed);
            }
            Direction::UpstreamToDownstream => {
                self.bytes_down.fetch_add(len, Ordering::Relaxed);
                self.chunks_down.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.touch();
    }

    /// Mark the session as active now
    pub fn touch(&self) {
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last forwarded chunk (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    /// Generate the final summary
    pub fn to_summary(
        &self,
        upstream_outcome: DirectionOutcome,
        downstream_outcome: DirectionOutcome,
        end: SessionEnd,
    ) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            client_addr: self.peers.client,
            upstream_addr: self.peers.upstream,
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            chunks_up: self.chunks_up.load(Ordering::Relaxed),
            chunks_down: self.chunks_down.load(Ordering::Relaxed),
            upstream_outcome,
            downstream_outcome,
            end,
        }
    }

    /// Log session statistics
    pub fn log_stats(&self, summary: &SessionSummary) {
        info!(
            session_id = %self.session_id,
            client_addr = ?self.peers.client,
            upstream_addr = ?self.peers.upstream,
            duration_ms = summary.duration_ms,
            bytes_up = summary.bytes_up,
            bytes_down = summary.bytes_down,
            clean = summary.is_clean(),
            "Relay session completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_per_direction() {
        let session = RelaySession::new(SessionId(1), SessionPeers::default());

        session.record_chunk(Direction::DownstreamToUpstream, 5);
        session.record_chunk(Direction::DownstreamToUpstream, 3);
        session.record_chunk(Direction::UpstreamToDownstream, 10);

        assert_eq!(session.bytes_up(), 8);
        assert_eq!(session.bytes_down(), 10);
        assert_eq!(session.total_bytes(), 18);

        let summary = session.to_summary(
            DirectionOutcome::Completed,
            DirectionOutcome::Completed,
            SessionEnd::Finished,
        );
        assert_eq!(summary.chunks_up, 2);
        assert_eq!(summary.chunks_down, 1);
        assert!(summary.is_clean());
    }

    #[test]
    fn test_summary_flags_failures() {
        let session = RelaySession::new(SessionId(2), SessionPeers::default());
        let summary = session.to_summary(
            DirectionOutcome::Failed("connection reset".to_string()),
            DirectionOutcome::Completed,
            SessionEnd::Finished,
        );

        assert!(!summary.is_clean());
        assert_eq!(
            summary.outcome(Direction::DownstreamToUpstream),
            &DirectionOutcome::Failed("connection reset".to_string())
        );

        let json: serde_json::Value = serde_json::from_str(&summary.to_json()).unwrap();
        assert_eq!(json["session_id"], 2);
        assert_eq!(json["upstream_outcome"]["status"], "failed");
        assert_eq!(json["upstream_outcome"]["cause"], "connection reset");
        assert_eq!(json["end"], "finished");
    }

    #[tokio::test]
    async fn test_idle_clock_resets_on_activity() {
        let session = RelaySession::new(SessionId(3), SessionPeers::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.idle_for() >= Duration::from_millis(40));

        session.record_chunk(Direction::UpstreamToDownstream, 1);
        assert!(session.idle_for() < Duration::from_millis(40));
    }
}
