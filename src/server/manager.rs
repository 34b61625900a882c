//! Relay Server Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{ConnectionPair, PairOptions, SessionPeers, SessionSummary};
use crate::server::acceptor::Acceptor;
use crate::server::admission::{Admission, AdmissionStats, SessionSlot};
use crate::sink::{ByteSink, SessionEventKind, SessionId, SinkGuard};
use crate::upstream::{Dialer, Endpoint};

/// Upper bound of the doubling accept backoff
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Extra time given to force-closed sessions before their tasks are aborted
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a relay server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Failed)
    }
}

/// Report returned by a cleanly stopped server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerExit {
    pub sessions_served: u64,
    /// Sessions still running at the end of the grace period
    pub force_closed: usize,
}

struct Shared {
    local_addr: SocketAddr,
    state: watch::Sender<ServerState>,
    force_close: watch::Sender<bool>,
    admission: Admission,
    next_session_id: AtomicU64,
    sessions_served: AtomicU64,
}

impl Shared {
    fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cloneable control handle for a running server
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stop accepting and shut down; idempotent.
    ///
    /// Returns true for the call that initiated the stop.
    pub fn stop(&self) -> bool {
        let initiated = self.shared.state.send_if_modified(|state| {
            if *state == ServerState::Running {
                *state = ServerState::Stopping;
                true
            } else {
                false
            }
        });
        if initiated {
            info!("Stop requested for relay on {}", self.shared.local_addr);
        }
        initiated
    }

    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.shared.admission.active_sessions()
    }

    pub fn sessions_served(&self) -> u64 {
        self.shared.sessions_served.load(Ordering::Relaxed)
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.shared.admission.stats()
    }

    /// Wait until the server reaches `Stopped` or `Failed`
    pub async fn wait_for_exit(&self) -> ServerState {
        let mut rx = self.shared.state.subscribe();
        let result = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        result
    }
}

/// Accepts client connections and relays each to the fixed upstream
pub struct RelayServer<A = TcpListener> {
    acceptor: A,
    config: Arc<Config>,
    sink: SinkGuard,
    dialer: Arc<Dialer>,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Bind the listening socket; the server is `Running` once this returns
    pub async fn bind(config: Arc<Config>, sink: Arc<dyn ByteSink>) -> Result<Self, RelayError> {
        let endpoint = config
            .upstream
            .endpoint
            .clone()
            .ok_or_else(|| RelayError::Config("upstream endpoint is not set".to_string()))?;

        let bind_addr = config.server.listen_addr;
        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| RelayError::Bind { addr: bind_addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr: bind_addr, source })?;
        info!("Successfully bound to {}", local_addr);

        Ok(Self::assemble(listener, local_addr, endpoint, config, sink))
    }

    /// Bind, then run the accept loop on a spawned task
    pub async fn start(
        config: Arc<Config>,
        sink: Arc<dyn ByteSink>,
    ) -> Result<(ServerHandle, JoinHandle<Result<ServerExit, RelayError>>), RelayError> {
        let server = Self::bind(config, sink).await?;
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        Ok((handle, task))
    }
}

impl<A: Acceptor> RelayServer<A> {
    fn assemble(
        acceptor: A,
        local_addr: SocketAddr,
        endpoint: Endpoint,
        config: Arc<Config>,
        sink: Arc<dyn ByteSink>,
    ) -> Self {
        let dialer = Dialer::new(
            endpoint,
            config.upstream.connect_timeout,
            config.upstream.max_dial_backoff,
        );
        let (state, _) = watch::channel(ServerState::Running);
        let (force_close, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            local_addr,
            state,
            force_close,
            admission: Admission::new(config.session_limit(), config.server.admission),
            next_session_id: AtomicU64::new(1),
            sessions_served: AtomicU64::new(0),
        });

        Self {
            acceptor,
            config,
            sink: SinkGuard::new(sink),
            dialer: Arc::new(dialer),
            shared,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Main accept loop; returns after `stop()` or a fatal listener failure
    pub async fn run(self) -> Result<ServerExit, RelayError> {
        let RelayServer {
            mut acceptor,
            config,
            sink,
            dialer,
            shared,
        } = self;

        let options = PairOptions {
            chunk_size: config.relay.chunk_size,
            idle_timeout: config.relay.idle_timeout,
        };
        let base_backoff = config.server.accept_backoff.min(MAX_ACCEPT_BACKOFF);
        let max_failures = config.server.max_accept_failures;

        let mut state_rx = shared.state.subscribe();
        let mut sessions: JoinSet<Option<SessionSummary>> = JoinSet::new();
        let mut consecutive_failures: u32 = 0;
        let mut backoff = base_backoff;

        info!(
            "Relaying {} -> {} (limit: {:?}, admission: {:?})",
            shared.local_addr,
            dialer.endpoint(),
            shared.admission.limit(),
            shared.admission.policy()
        );

        let failure = loop {
            if *state_rx.borrow() != ServerState::Running {
                break None;
            }

            // Blocking admission: hold the slot before accepting, so excess
            // clients wait in the kernel backlog.
            let reserved = if shared.admission.blocks_accept() {
                let slot = loop {
                    tokio::select! {
                        slot = shared.admission.acquire() => break Some(slot),
                        _ = stop_requested(&mut state_rx) => break None,
                        Some(joined) = sessions.join_next() => reap(&shared, joined),
                    }
                };
                match slot {
                    Some(Ok(slot)) => Some(slot),
                    Some(Err(e)) => {
                        warn!("Admission failed: {}", e);
                        continue;
                    }
                    None => break None,
                }
            } else {
                None
            };

            let accepted = loop {
                tokio::select! {
                    accepted = acceptor.accept() => break Some(accepted),
                    _ = stop_requested(&mut state_rx) => break None,
                    Some(joined) = sessions.join_next() => reap(&shared, joined),
                }
            };
            let Some(accepted) = accepted else {
                break None;
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    consecutive_failures = 0;
                    backoff = base_backoff;

                    let id = shared.next_session_id();
                    let slot = match reserved {
                        Some(slot) => slot,
                        None => match shared.admission.try_acquire() {
                            Ok(slot) => slot,
                            Err(e) => {
                                sink.event(
                                    id,
                                    SessionEventKind::CapacityExceeded,
                                    format!("{}; closed connection from {}", e, client_addr),
                                );
                                drop(stream);
                                continue;
                            }
                        },
                    };

                    debug!("Accepted connection {} from {}", id, client_addr);
                    sessions.spawn(handle_session(
                        id,
                        stream,
                        client_addr,
                        slot,
                        Arc::clone(&dialer),
                        sink.clone(),
                        options,
                        shared.force_close.subscribe(),
                    ));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        "Error accepting connection ({}/{}): {}",
                        consecutive_failures, max_failures, e
                    );
                    sink.event(
                        SessionId::LISTENER,
                        SessionEventKind::ListenerError,
                        format!("accept failed ({}/{}): {}", consecutive_failures, max_failures, e),
                    );

                    if consecutive_failures >= max_failures {
                        break Some(RelayError::ListenerFailed {
                            failures: consecutive_failures,
                            source: e,
                        });
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = stop_requested(&mut state_rx) => break None,
                    }
                    backoff = next_backoff(backoff);
                }
            }
        };

        drop(acceptor);
        info!("Connection acceptance loop stopped, listener closed");

        let force_closed =
            drain_sessions(&shared, &mut sessions, config.server.shutdown_timeout).await;

        match failure {
            Some(e) => {
                shared.state.send_replace(ServerState::Failed);
                error!("Relay server failed: {}", e);
                Err(e)
            }
            None => {
                shared.state.send_replace(ServerState::Stopped);
                let exit = ServerExit {
                    sessions_served: shared.sessions_served.load(Ordering::Relaxed),
                    force_closed,
                };
                info!("Relay server stopped after {} sessions", exit.sessions_served);
                Ok(exit)
            }
        }
    }
}

/// Doubles the accept backoff up to its cap
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_ACCEPT_BACKOFF)
}

/// Dial the upstream for one accepted client and relay until both sides finish
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(session = %id, client = %client_addr))]
async fn handle_session(
    id: SessionId,
    client: TcpStream,
    client_addr: SocketAddr,
    slot: SessionSlot,
    dialer: Arc<Dialer>,
    sink: SinkGuard,
    options: PairOptions,
    force_close: watch::Receiver<bool>,
) -> Option<SessionSummary> {
    // Held for the whole session so admission sees it as active.
    let _slot = slot;

    if let Err(e) = client.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on client socket: {}", e);
    }

    let (upstream, upstream_addr) = match dialer.dial().await {
        Ok(connected) => connected,
        Err(e) => {
            sink.event(
                id,
                SessionEventKind::DialFailed,
                format!("{}; closing client {}", e, client_addr),
            );
            drop(client);
            return None;
        }
    };

    let peers = SessionPeers {
        client: Some(client_addr),
        upstream: Some(upstream_addr),
    };
    let summary = ConnectionPair::new(id, peers, client, upstream, sink, options)
        .with_force_close(force_close)
        .run()
        .await;
    Some(summary)
}

async fn stop_requested(state_rx: &mut watch::Receiver<ServerState>) {
    let _ = state_rx.wait_for(|state| *state != ServerState::Running).await;
}

fn reap(shared: &Shared, joined: Result<Option<SessionSummary>, JoinError>) {
    match joined {
        Ok(Some(summary)) => {
            shared.sessions_served.fetch_add(1, Ordering::Relaxed);
            debug!("Session {} finished (clean: {})", summary.session_id, summary.is_clean());
        }
        Ok(None) => {}
        Err(e) if e.is_panic() => error!("Session task panicked: {}", e),
        Err(e) => debug!("Session task cancelled: {}", e),
    }
}

/// Wait for active sessions, force-closing whatever outlives `grace`
async fn drain_sessions(
    shared: &Shared,
    sessions: &mut JoinSet<Option<SessionSummary>>,
    grace: Duration,
) -> usize {
    if sessions.is_empty() {
        return 0;
    }

    info!(
        "Waiting for {} active sessions to close (timeout: {:?})",
        sessions.len(),
        grace
    );
    let drained = timeout(grace, async {
        while let Some(joined) = sessions.join_next().await {
            reap(shared, joined);
        }
    })
    .await;
    if drained.is_ok() {
        info!("All sessions closed gracefully");
        return 0;
    }

    let remaining = sessions.len();
    warn!(
        "Shutdown timeout reached with {} sessions still active, force-closing",
        remaining
    );
    shared.force_close.send_replace(true);

    let forced = timeout(FORCE_CLOSE_GRACE, async {
        while let Some(joined) = sessions.join_next().await {
            reap(shared, joined);
        }
    })
    .await;
    if forced.is_err() {
        sessions.abort_all();
        while let Some(joined) = sessions.join_next().await {
            reap(shared, joined);
        }
    }
    remaining
}
