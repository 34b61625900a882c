//! Traffic Observation Sinks
//!
//! Every chunk the relay forwards, and every session lifecycle event, is
//! handed to a [`ByteSink`]. Implementations must tolerate concurrent calls
//! from independent sessions and do their own synchronization.
//!
//! The relay never calls a sink directly: all calls go through
//! [`SinkGuard`], which turns errors and panics into logged `SinkFailure`s
//! so a misbehaving sink can never fail a session.

pub mod detached;
pub mod tracing_sink;
pub mod transcript;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::RelayError;

pub use detached::DetachedSink;
pub use tracing_sink::TracingSink;
pub use transcript::TranscriptSink;

/// Identifier of a relayed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Reserved id for events raised by the listener itself
    pub const LISTENER: SessionId = SessionId(0);

    pub fn is_listener(&self) -> bool {
        *self == Self::LISTENER
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_listener() {
            write!(f, "listener")
        } else {
            write!(f, "conn_{}", self.0)
        }
    }
}

/// Direction of a byte stream within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    #[serde(rename = "client->upstream")]
    DownstreamToUpstream,
    #[serde(rename = "upstream->client")]
    UpstreamToDownstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::DownstreamToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToDownstream => write!(f, "upstream->client"),
        }
    }
}

/// Kind of lifecycle event reported to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Upstream dialled, pair about to start
    Opened,
    /// Upstream dial failed; inbound connection closed
    DialFailed,
    /// Admission control rejected the inbound connection
    CapacityExceeded,
    /// One direction finished and its destination was shut down for writing
    HalfClosed,
    /// One direction ended with a read or write error
    CopyFailed,
    /// No traffic for longer than the idle timeout
    IdleTimeout,
    /// Session aborted by server shutdown
    ForceClosed,
    /// Final aggregate outcome of a session
    Summary,
    /// Accept error on the listening socket
    ListenerError,
}

impl SessionEventKind {
    /// Whether the event reports a failure of some kind
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionEventKind::DialFailed
                | SessionEventKind::CapacityExceeded
                | SessionEventKind::CopyFailed
                | SessionEventKind::IdleTimeout
                | SessionEventKind::ForceClosed
                | SessionEventKind::ListenerError
        )
    }
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionEventKind::Opened => "opened",
            SessionEventKind::DialFailed => "dial_failed",
            SessionEventKind::CapacityExceeded => "capacity_exceeded",
            SessionEventKind::HalfClosed => "half_closed",
            SessionEventKind::CopyFailed => "copy_failed",
            SessionEventKind::IdleTimeout => "idle_timeout",
            SessionEventKind::ForceClosed => "force_closed",
            SessionEventKind::Summary => "summary",
            SessionEventKind::ListenerError => "listener_error",
        };
        f.write_str(name)
    }
}

/// Consumer of observed traffic and session events
pub trait ByteSink: Send + Sync {
    /// Called with every chunk before it is written to its destination
    fn observe(&self, session: SessionId, direction: Direction, bytes: &[u8]) -> anyhow::Result<()>;

    /// Called on session lifecycle transitions
    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()>;
}

impl<T: ByteSink + ?Sized> ByteSink for Arc<T> {
    fn observe(
        &self,
        session: SessionId,
        direction: Direction,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        (**self).observe(session, direction, bytes)
    }

    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()> {
        (**self).session_event(session, kind, detail)
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ByteSink for NullSink {
    fn observe(&self, _: SessionId, _: Direction, _: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out to several sinks; every sink sees every call even if an earlier one fails
#[derive(Default, Clone)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn ByteSink>>,
}

impl TeeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ByteSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each<F>(&self, mut call: F) -> anyhow::Result<()>
    where
        F: FnMut(&dyn ByteSink) -> anyhow::Result<()>,
    {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = call(sink.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ByteSink for TeeSink {
    fn observe(
        &self,
        session: SessionId,
        direction: Direction,
        bytes: &[u8],
    ) -> anyhow::Result<()> {
        self.each(|sink| sink.observe(session, direction, bytes))
    }

    fn session_event(
        &self,
        session: SessionId,
        kind: SessionEventKind,
        detail: &str,
    ) -> anyhow::Result<()> {
        self.each(|sink| sink.session_event(session, kind, detail))
    }
}

/// Defensive wrapper through which the relay talks to its sink
#[derive(Clone)]
pub struct SinkGuard {
    inner: Arc<dyn ByteSink>,
    failures: Arc<AtomicU64>,
}

impl SinkGuard {
    pub fn new(inner: Arc<dyn ByteSink>) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver a chunk; failures are logged and counted, never returned
    pub fn observe(&self, session: SessionId, direction: Direction, bytes: &[u8]) {
        let outcome =
            catch_unwind(AssertUnwindSafe(|| self.inner.observe(session, direction, bytes)));
        self.settle(session, outcome);
    }

    /// Deliver a lifecycle event; failures are logged and counted, never returned
    pub fn event(&self, session: SessionId, kind: SessionEventKind, detail: impl AsRef<str>) {
        let detail = detail.as_ref();
        let outcome =
            catch_unwind(AssertUnwindSafe(|| self.inner.session_event(session, kind, detail)));
        self.settle(session, outcome);
    }

    /// Number of sink calls that failed or panicked
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn settle(&self, session: SessionId, outcome: std::thread::Result<anyhow::Result<()>>) {
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => RelayError::Sink(format!("{:#}", e)),
            Err(panic) => {
                RelayError::Sink(format!("sink panicked: {}", panic_message(panic.as_ref())))
            }
        };
        self.failures.fetch_add(1, Ordering::Relaxed);
        warn!(session = %session, "{}", failure);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingSink;

    impl ByteSink for FailingSink {
        fn observe(&self, _: SessionId, _: Direction, _: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }

        fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
            panic!("renderer crashed")
        }
    }

    #[derive(Default)]
    struct CountingSink {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl ByteSink for CountingSink {
        fn observe(&self, _: SessionId, _: Direction, bytes: &[u8]) -> anyhow::Result<()> {
            self.chunks.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn session_event(&self, _: SessionId, _: SessionEventKind, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_guard_swallows_errors_and_panics() {
        let guard = SinkGuard::new(Arc::new(FailingSink));

        guard.observe(SessionId(1), Direction::DownstreamToUpstream, b"abc");
        guard.event(SessionId(1), SessionEventKind::Opened, "detail");

        assert_eq!(guard.failures(), 2);
    }

    #[test]
    fn test_tee_reaches_every_sink() {
        let counting = Arc::new(CountingSink::default());
        let tee = TeeSink::new()
            .with(Arc::new(FailingSink))
            .with(counting.clone());

        let result = tee.observe(SessionId(3), Direction::UpstreamToDownstream, b"xyz");

        assert!(result.is_err());
        assert_eq!(counting.chunks.lock().unwrap().as_slice(), &[b"xyz".to_vec()]);
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(7).to_string(), "conn_7");
        assert_eq!(SessionId::LISTENER.to_string(), "listener");
    }
}
