//! Graceful Shutdown Handling
//!
//! Translates SIGTERM, SIGINT and Ctrl+C into a single stop request for the
//! relay server. Draining and force-closing sessions is done by the server
//! itself within its configured shutdown timeout.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::server::{ServerHandle, ServerState};
use crate::Result;

/// Headroom on top of the drain timeout for force-closing and cleanup
const COMPLETION_BUFFER: Duration = Duration::from_secs(10);

/// Shutdown coordinator that turns OS signals into a server stop
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Drain timeout configured on the server
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, timeout }
    }

    /// Receiver for components that want to observe the shutdown request
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request shutdown without waiting for a signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown requested with no subscribers");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop `server` as soon as shutdown is requested.
    ///
    /// Subscribes immediately, so a request made before the returned future is
    /// first polled is not missed. Returns early if the server exits on its own.
    pub fn stop_on_shutdown(
        &self,
        server: ServerHandle,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.subscribe();
        async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    if !server.stop() {
                        debug!("Server was already stopping");
                    }
                }
                state = server.wait_for_exit() => {
                    debug!("Server exited ({:?}) before a shutdown request", state);
                }
            }
        }
    }

    /// Wait for the server to finish, bounded by the drain timeout plus headroom
    pub async fn wait_for_completion(&self, server: &ServerHandle) -> Result<ServerState> {
        let state = tokio::time::timeout(self.timeout + COMPLETION_BUFFER, server.wait_for_exit())
            .await
            .map_err(|_| anyhow::anyhow!("Shutdown completion timeout"))?;

        if state == ServerState::Failed {
            warn!("Server finished in failed state");
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::RelayServer;
    use crate::sink::NullSink;
    use crate::upstream::Endpoint;
    use std::sync::Arc;

    async fn start_server() -> ServerHandle {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.upstream.endpoint = Some(Endpoint::new("127.0.0.1", 9));
        let (handle, _task) = RelayServer::start(Arc::new(config), Arc::new(NullSink))
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_stops_server() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)));
        let server = start_server().await;

        let stopper = {
            let coordinator = Arc::clone(&coordinator);
            let server = server.clone();
            tokio::spawn(async move { coordinator.stop_on_shutdown(server).await })
        };

        // Let the stopper subscribe before triggering.
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.trigger();
        stopper.await.unwrap();

        let state = coordinator.wait_for_completion(&server).await.unwrap();
        assert_eq!(state, ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_shutdown_returns_when_server_exits() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let server = start_server().await;

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), coordinator.stop_on_shutdown(server))
            .await
            .expect("stop_on_shutdown did not return after server exit");
    }
}
