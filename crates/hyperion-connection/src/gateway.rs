//! Outbound connection to the fixed backend ("gateway")

use crate::liveness;
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default upper bound on a single gateway dial
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway {host}:{port} unavailable: {reason}")]
    Unavailable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Gateway connection is not established")]
    NotConnected,
}

impl GatewayError {
    fn unavailable(host: &str, port: u16, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            host: host.to_string(),
            port,
            reason: reason.into(),
        }
    }
}

/// Hostname resolution used when the gateway target is not a literal IP
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to socket addresses carrying `port`
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system resolver via `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// Connection to the backend, owned by a single relay task
pub struct GatewayConnection {
    host: String,
    port: u16,
    connect_timeout: Duration,
    resolver: Arc<dyn Resolver>,
    stream: Option<TcpStream>,
}

impl GatewayConnection {
    /// Create an unconnected gateway handle for `host` (literal IP or DNS name)
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resolver: Arc::new(SystemResolver),
            stream: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Dial the gateway.
    ///
    /// A literal IP is dialed directly without touching the resolver. Anything
    /// else is resolved and the first returned address is dialed.
    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        let addr = match self.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port),
            Err(_) => self.resolve_first().await?,
        };

        debug!(gateway = %addr, host = %self.host, "Dialing gateway");

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(GatewayError::unavailable(&self.host, self.port, e.to_string()));
            }
            Err(_) => {
                return Err(GatewayError::unavailable(
                    &self.host,
                    self.port,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(gateway = %addr, error = %e, "Failed to set TCP_NODELAY on gateway stream");
        }

        self.stream = Some(stream);
        Ok(())
    }

    async fn resolve_first(&self) -> Result<SocketAddr, GatewayError> {
        let addrs = self
            .resolver
            .resolve(&self.host, self.port)
            .await
            .map_err(|e| GatewayError::unavailable(&self.host, self.port, e.to_string()))?;

        addrs.into_iter().next().ok_or_else(|| {
            GatewayError::unavailable(&self.host, self.port, "name resolution returned no addresses")
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Result<&TcpStream, GatewayError> {
        self.stream.as_ref().ok_or(GatewayError::NotConnected)
    }

    pub fn stream_mut(&mut self) -> Result<&mut TcpStream, GatewayError> {
        self.stream.as_mut().ok_or(GatewayError::NotConnected)
    }

    /// Non-blocking liveness check. A connection that was never established or
    /// has been closed reports disconnected.
    pub fn is_disconnected(&self) -> bool {
        match &self.stream {
            Some(stream) => liveness::is_disconnected(stream),
            None => true,
        }
    }

    /// Close the gateway transport. No-op when not connected.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(host = %self.host, error = %e, "Gateway shutdown");
            }
        }
    }
}
