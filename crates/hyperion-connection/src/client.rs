//! Accepted client connections
//!
//! A [`ConnectionRecord`] is the shareable half of an accepted client: its
//! endpoints, traffic counters, and the ability to force-close the socket from
//! any task. The [`ClientConnection`] is the owning half held by the relay task,
//! which does all reads and writes.

use crate::id::ConnectionId;
use crate::liveness;
use chrono::{DateTime, Utc};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared bookkeeping for one accepted client transport
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    /// Duplicate handle of the accepted socket, only used to shut it down
    socket: std::net::TcpStream,
    disconnect: CancellationToken,
    bytes_from_client: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl ConnectionRecord {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Relay-side endpoint of the client connection
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Client endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Close the client socket.
    ///
    /// Safe to call from any task and more than once. The owning relay task
    /// observes it through [`ConnectionRecord::disconnected`] and through the
    /// socket itself reporting EOF.
    pub fn disconnect(&self) {
        self.disconnect.cancel();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // ENOTCONN once the peer or a previous call already closed it
            debug!(connection_id = %self.id, error = %e, "Client socket shutdown");
        }
    }

    pub fn is_disconnect_requested(&self) -> bool {
        self.disconnect.is_cancelled()
    }

    /// Resolves once [`ConnectionRecord::disconnect`] has been called
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await
    }

    pub fn record_from_client(&self, bytes: u64) {
        self.bytes_from_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes read from the client and forwarded to the gateway
    pub fn bytes_from_client(&self) -> u64 {
        self.bytes_from_client.load(Ordering::Relaxed)
    }

    /// Bytes read from the gateway and forwarded to the client
    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Relaxed)
    }
}

/// The relay task's owning handle over an accepted client stream
pub struct ClientConnection {
    record: Arc<ConnectionRecord>,
    stream: TcpStream,
}

impl ClientConnection {
    /// Wrap an accepted stream.
    ///
    /// `disconnect` is the token that [`ConnectionRecord::disconnect`] cancels;
    /// passing a child of a server-wide token makes server shutdown reach
    /// connections that are not registered yet.
    pub fn accept(
        id: ConnectionId,
        stream: TcpStream,
        disconnect: CancellationToken,
    ) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let std_stream = stream.into_std()?;
        let socket = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        let record = ConnectionRecord {
            id,
            local_addr,
            remote_addr,
            connected_at: Utc::now(),
            socket,
            disconnect,
            bytes_from_client: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        };

        Ok(Self {
            record: Arc::new(record),
            stream,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.record.id
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Non-blocking liveness check, see [`liveness::is_disconnected`]
    pub fn is_disconnected(&self) -> bool {
        self.record.is_disconnect_requested() || liveness::is_disconnected(&self.stream)
    }

    /// Dispose of the client transport
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
        self.record.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn accepted() -> (ClientConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, _) = accepted.unwrap();
        let client =
            ClientConnection::accept(ConnectionId::new(), stream, CancellationToken::new())
                .unwrap();
        (client, peer.unwrap())
    }

    #[tokio::test]
    async fn test_endpoints_derived_from_stream() {
        let (client, peer) = accepted().await;
        let record = client.record();

        assert_eq!(record.remote_addr(), peer.local_addr().unwrap());
        assert_eq!(record.local_addr(), peer.peer_addr().unwrap());
        assert_eq!(record.id(), client.id());
    }

    #[tokio::test]
    async fn test_disconnect_closes_socket_for_peer() {
        let (client, mut peer) = accepted().await;

        client.record().disconnect();
        assert!(client.record().is_disconnect_requested());
        assert!(client.is_disconnected());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("peer read timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // Second call is harmless
        client.record().disconnect();
    }

    #[tokio::test]
    async fn test_disconnected_future_resolves() {
        let (client, _peer) = accepted().await;
        let record = client.record().clone();

        let waiter = tokio::spawn(async move { record.disconnected().await });
        client.record().disconnect();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("disconnected() never resolved")
            .unwrap();
    }

    #[tokio::test]
    async fn test_traffic_counters() {
        let (client, _peer) = accepted().await;
        let record = client.record();

        record.record_from_client(10);
        record.record_from_client(5);
        record.record_to_client(7);

        assert_eq!(record.bytes_from_client(), 15);
        assert_eq!(record.bytes_to_client(), 7);
    }
}
