//! Relay server orchestration
//!
//! Accepts client connections, enforces the connection limit, spawns one relay
//! task per admitted client, and coordinates shutdown across all of them.

use crate::duplex::{BurstLimits, DEFAULT_CHUNK_SIZE};
use crate::error::RelayServerError;
use crate::relay::{self, RelayContext};
use chrono::{DateTime, Utc};
use hyperion_connection::{ConnectionId, Resolver, SystemResolver, DEFAULT_CONNECT_TIMEOUT};
use hyperion_control::{AuthenticityState, ConnectionRegistry, SecurityViolation};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default maximum number of simultaneous client connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 25;

/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Backend every client connection is relayed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl GatewayTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub gateway: GatewayTarget,
    pub chunk_size: usize,
    pub burst: BurstLimits,
}

impl RelayServerConfig {
    pub fn new(bind_addr: SocketAddr, gateway: GatewayTarget) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            gateway,
            chunk_size: DEFAULT_CHUNK_SIZE,
            burst: BurstLimits::default(),
        }
    }
}

/// Point-in-time view of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub state: AuthenticityState,
    pub connected_at: DateTime<Utc>,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
}

pub struct RelayServer {
    config: RelayServerConfig,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    resolver: Arc<dyn Resolver>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        let permits = config.max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            admission: Arc::new(Semaphore::new(permits)),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Use a custom resolver for the gateway host
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Number of live (registered) connections
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|entry| ConnectionInfo {
                id: entry.record.id(),
                peer_addr: entry.record.remote_addr(),
                local_addr: entry.record.local_addr(),
                state: entry.session.state(),
                connected_at: entry.record.connected_at(),
                bytes_from_client: entry.record.bytes_from_client(),
                bytes_to_client: entry.record.bytes_to_client(),
            })
            .collect()
    }

    /// Revoke a live connection's session; its relay task tears it down
    pub fn revoke(&self, id: &ConnectionId, reason: &str) -> Option<SecurityViolation> {
        self.registry.revoke(id, reason)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn bind_with_retry(&self) -> Result<TcpListener, RelayServerError> {
        // Retry bind to ride out TIME_WAIT (up to 3 attempts with 1 second delays)
        for attempt in 1..=3 {
            match TcpListener::bind(&self.config.bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/3",
                            self.config.bind_addr, attempt
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                    warn!(
                        "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                        self.config.bind_addr.port(),
                        attempt
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(RelayServerError::BindError {
                        address: self.config.bind_addr.ip().to_string(),
                        port: self.config.bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(RelayServerError::BindError {
            address: self.config.bind_addr.ip().to_string(),
            port: self.config.bind_addr.port(),
            reason: "Address in use after 3 retry attempts".to_string(),
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self) -> Result<(), RelayServerError> {
        let listener = self.bind_with_retry().await?;
        self.serve(listener).await
    }

    /// Serve clients from an already bound listener until shutdown.
    ///
    /// Returns once shutdown was requested and every relay task has finished.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayServerError> {
        let addr = listener.local_addr()?;
        info!(
            "Relay listening on {} (gateway {}:{}, max {} connections)",
            addr, self.config.gateway.host, self.config.gateway.port, self.config.max_connections
        );

        let ctx = Arc::new(RelayContext {
            registry: self.registry.clone(),
            gateway: self.config.gateway.clone(),
            resolver: self.resolver.clone(),
            chunk_size: self.config.chunk_size.max(1),
            limits: self.config.burst,
        });

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr, &ctx),
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.tasks.close();
        self.tasks.wait().await;
        info!("Relay on {} stopped", addr);
        Ok(())
    }

    fn admit(&self, stream: TcpStream, peer_addr: SocketAddr, ctx: &Arc<RelayContext>) {
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                info!(
                    "Incoming connection from {} rejected (limit of {} connections reached)",
                    peer_addr, self.config.max_connections
                );
                drop(stream);
                return;
            }
        };

        debug!("New connection from {}", peer_addr);
        let disconnect = self.shutdown.child_token();
        self.tasks.spawn(relay::handle_connection(
            stream,
            peer_addr,
            ctx.clone(),
            disconnect,
            permit,
        ));
    }

    /// Stop accepting, disconnect every client, and wait for relay tasks to finish
    pub async fn request_shutdown(&self) {
        info!("Disconnecting all clients...");
        self.shutdown.cancel();
        let disconnected = self.registry.disconnect_all();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Shutdown complete ({} clients disconnected)", disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayServerConfig {
        RelayServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            GatewayTarget::new("127.0.0.1", 9),
        )
    }

    #[test]
    fn test_relay_server_config_defaults() {
        let config = config();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.gateway.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.burst, BurstLimits::default());
    }

    #[test]
    fn test_new_server_is_idle() {
        let server = RelayServer::new(config());
        assert_eq!(server.active_connections(), 0);
        assert!(server.connections().is_empty());
        assert!(!server.is_shutting_down());
        assert!(server.revoke(&ConnectionId::new(), "nobody").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_without_clients_completes() {
        let server = Arc::new(RelayServer::new(config()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        server.request_shutdown().await;
        assert!(server.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve did not return after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_conflict_reports_bind_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config();
        config.bind_addr = occupied.local_addr().unwrap();

        let server = RelayServer::new(config);
        let err = server.start().await.unwrap_err();
        match err {
            RelayServerError::BindError { address, port, .. } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(port, occupied.local_addr().unwrap().port());
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
