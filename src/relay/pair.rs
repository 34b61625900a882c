//! Connection Pair
//!
//! Runs the two copiers of a session and coordinates their shutdown. When a
//! direction finishes, for any reason, the write side of its destination is
//! shut down so end-of-stream reaches the peer while the opposite direction
//! keeps flowing. Both connections are released once both directions end.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, instrument, warn};

use crate::error::{CopyError, RelayError};
use crate::relay::copier::{StreamCopier, DEFAULT_CHUNK_SIZE};
use crate::relay::session::{
    DirectionOutcome, RelaySession, SessionEnd, SessionPeers, SessionSummary,
};
use crate::sink::{Direction, SessionEventKind, SessionId, SinkGuard};

/// Per-session tuning
#[derive(Debug, Clone, Copy)]
pub struct PairOptions {
    pub chunk_size: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: None,
        }
    }
}

type CopyTask<R, W> = JoinHandle<(Result<u64, CopyError>, R, W)>;

/// One downstream and one upstream connection relayed to each other
pub struct ConnectionPair<D, U> {
    session: Arc<RelaySession>,
    downstream: D,
    upstream: U,
    sink: SinkGuard,
    options: PairOptions,
    force_close: Option<watch::Receiver<bool>>,
}

impl<D, U> ConnectionPair<D, U>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        session_id: SessionId,
        peers: SessionPeers,
        downstream: D,
        upstream: U,
        sink: SinkGuard,
        options: PairOptions,
    ) -> Self {
        Self {
            session: Arc::new(RelaySession::new(session_id, peers)),
            downstream,
            upstream,
            sink,
            options,
            force_close: None,
        }
    }

    /// Abort the session as soon as `signal` turns true
    pub fn with_force_close(mut self, signal: watch::Receiver<bool>) -> Self {
        self.force_close = Some(signal);
        self
    }

    /// Relay until both directions have finished
    #[instrument(skip(self), fields(session = %self.session.session_id))]
    pub async fn run(self) -> SessionSummary {
        let ConnectionPair {
            session,
            downstream,
            upstream,
            sink,
            options,
            mut force_close,
        } = self;
        let id = session.session_id;

        sink.event(id, SessionEventKind::Opened, describe_peers(&session.peers));

        let (down_read, down_write) = tokio::io::split(downstream);
        let (up_read, up_write) = tokio::io::split(upstream);

        let mut to_upstream: CopyTask<ReadHalf<D>, WriteHalf<U>> = spawn_copier(
            StreamCopier::new(
                Direction::DownstreamToUpstream,
                options.chunk_size,
                sink.clone(),
                session.clone(),
            ),
            down_read,
            up_write,
        );
        let mut to_downstream: CopyTask<ReadHalf<U>, WriteHalf<D>> = spawn_copier(
            StreamCopier::new(
                Direction::UpstreamToDownstream,
                options.chunk_size,
                sink.clone(),
                session.clone(),
            ),
            up_read,
            down_write,
        );

        let mut upstream_outcome: Option<DirectionOutcome> = None;
        let mut downstream_outcome: Option<DirectionOutcome> = None;
        // Finished halves are held until the whole pair is done.
        let mut upstream_halves = None;
        let mut downstream_halves = None;

        let end = loop {
            if upstream_outcome.is_some() && downstream_outcome.is_some() {
                break SessionEnd::Finished;
            }

            tokio::select! {
                joined = &mut to_upstream, if upstream_outcome.is_none() => {
                    let (outcome, halves) =
                        settle_direction(&sink, id, Direction::DownstreamToUpstream, joined).await;
                    upstream_outcome = Some(outcome);
                    upstream_halves = halves;
                }
                joined = &mut to_downstream, if downstream_outcome.is_none() => {
                    let (outcome, halves) =
                        settle_direction(&sink, id, Direction::UpstreamToDownstream, joined).await;
                    downstream_outcome = Some(outcome);
                    downstream_halves = halves;
                }
                _ = idle_expired(&session, options.idle_timeout) => {
                    let detail = format!("no traffic for {:?}", session.idle_for());
                    sink.event(id, SessionEventKind::IdleTimeout, detail);
                    break SessionEnd::IdleTimeout;
                }
                _ = force_close_requested(force_close.as_mut()) => {
                    sink.event(id, SessionEventKind::ForceClosed, "server shutting down");
                    break SessionEnd::ForceClosed;
                }
            }
        };

        if upstream_outcome.is_none() {
            abort_copier(to_upstream).await;
        }
        if downstream_outcome.is_none() {
            abort_copier(to_downstream).await;
        }
        drop(upstream_halves);
        drop(downstream_halves);

        let summary = session.to_summary(
            upstream_outcome.unwrap_or(DirectionOutcome::Aborted),
            downstream_outcome.unwrap_or(DirectionOutcome::Aborted),
            end,
        );
        session.log_stats(&summary);
        sink.event(id, SessionEventKind::Summary, summary.to_json());
        summary
    }
}

fn spawn_copier<R, W>(copier: StreamCopier, mut reader: R, mut writer: W) -> CopyTask<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = copier.copy(&mut reader, &mut writer).await;
        (result, reader, writer)
    })
}

/// Record how a direction ended and half-close its destination
async fn settle_direction<R, W>(
    sink: &SinkGuard,
    id: SessionId,
    direction: Direction,
    joined: Result<(Result<u64, CopyError>, R, W), JoinError>,
) -> (DirectionOutcome, Option<(R, W)>)
where
    W: AsyncWrite + Unpin,
{
    let (result, reader, mut writer) = match joined {
        Ok(parts) => parts,
        Err(e) => {
            warn!(session = %id, direction = %direction, "Copier task failed: {}", e);
            let cause = format!("copier task failed: {}", e);
            sink.event(id, SessionEventKind::CopyFailed, format!("{}: {}", direction, cause));
            return (DirectionOutcome::Failed(cause), None);
        }
    };

    let outcome = match result {
        Ok(bytes) => {
            debug!(session = %id, direction = %direction, bytes, "Direction reached end of stream");
            DirectionOutcome::Completed
        }
        Err(e) => {
            let cause = e.cause.to_string();
            let err = RelayError::from(e);
            debug!(session = %id, "{}", err);
            sink.event(id, SessionEventKind::CopyFailed, err.to_string());
            DirectionOutcome::Failed(cause)
        }
    };

    // The destination may already be gone; shutting it down again is harmless.
    if let Err(e) = writer.shutdown().await {
        debug!(session = %id, direction = %direction, "Half-close ignored: {}", e);
    }
    sink.event(id, SessionEventKind::HalfClosed, format!("{} write side closed", direction));

    (outcome, Some((reader, writer)))
}

async fn abort_copier<R, W>(task: CopyTask<R, W>) {
    task.abort();
    // Wait so the aborted task has released its socket halves.
    let _ = task.await;
}

async fn idle_expired(session: &RelaySession, idle_timeout: Option<Duration>) {
    let Some(limit) = idle_timeout else {
        return std::future::pending().await;
    };
    loop {
        let idle = session.idle_for();
        if idle >= limit {
            return;
        }
        tokio::time::sleep(limit - idle).await;
    }
}

async fn force_close_requested(signal: Option<&mut watch::Receiver<bool>>) {
    match signal {
        Some(rx) => {
            if rx.wait_for(|forced| *forced).await.is_err() {
                // Sender gone without forcing: never fires.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

fn describe_peers(peers: &SessionPeers) -> String {
    let show = |addr: Option<std::net::SocketAddr>| {
        addr.map(|a| a.to_string()).unwrap_or_else(|| "?".to_string())
    };
    format!("{} -> {}", show(peers.client), show(peers.upstream))
}
