//! Per-connection relay driver
//!
//! One task per admitted client: register the connection, dial the gateway,
//! pump bytes both ways until either side goes away or the session is revoked,
//! then tear everything down in a fixed order.

use crate::duplex::{copy_burst, Burst, BurstLimits, CopyError};
use crate::error::{Leg, RelayError};
use crate::server::GatewayTarget;
use hyperion_connection::{
    ClientConnection, ConnectionId, ConnectionRecord, GatewayConnection, Resolver,
};
use hyperion_control::{ConnectionRegistry, SecurityViolation, Session};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a relay task needs from the server
pub(crate) struct RelayContext {
    pub registry: Arc<ConnectionRegistry>,
    pub gateway: GatewayTarget,
    pub resolver: Arc<dyn Resolver>,
    pub chunk_size: usize,
    pub limits: BurstLimits,
}

/// How a relay loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The client closed its side
    ClientClosed,
    /// The gateway closed its side
    GatewayClosed,
    /// The connection was disconnected by the server during shutdown
    Disconnected,
}

impl fmt::Display for RelayExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayExit::ClientClosed => f.write_str("client closed"),
            RelayExit::GatewayClosed => f.write_str("gateway closed"),
            RelayExit::Disconnected => f.write_str("disconnected by server"),
        }
    }
}

/// Drive one admitted client connection from registration to teardown.
///
/// `permit` is the connection's admission slot; it is released during
/// teardown, right before the connection leaves the registry. The returned
/// outcome has already been logged.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<RelayContext>,
    disconnect: CancellationToken,
    permit: OwnedSemaphorePermit,
) -> Result<RelayExit, RelayError> {
    let id = ConnectionId::new();

    let mut client = match ClientConnection::accept(id, stream, disconnect) {
        Ok(client) => client,
        Err(e) => {
            warn!(connection_id = %id, %peer_addr, error = %e, "Dropped connection before registration");
            return Err(RelayError::transport(Leg::Client, e));
        }
    };

    let record = client.record().clone();
    let session = Arc::new(Session::new(id).with_peer(peer_addr));

    if let Err(e) = ctx.registry.insert(record.clone(), session.clone()) {
        error!(connection_id = %id, error = %e, "Failed to register connection");
        drop(permit);
        client.close().await;
        return Err(e.into());
    }

    info!(connection_id = %id, %peer_addr, "Client connected");

    let outcome = relay(&mut client, &session, &ctx).await;

    match &outcome {
        Ok(exit) => {
            debug!(connection_id = %id, reason = %exit, "Relay loop exited");
        }
        Err(RelayError::TransportFailure { leg, source }) => {
            warn!(connection_id = %id, %leg, error = %source, "IO failure, disconnecting");
        }
        Err(RelayError::SecurityViolation(_)) => {
            warn!(connection_id = %id, "Security violation committed, disconnecting");
        }
        Err(RelayError::UnavailableBackend(e)) => {
            error!(connection_id = %id, error = %e, "Gateway unavailable, aborting connection");
        }
        Err(RelayError::Unclassified(message)) => {
            error!(connection_id = %id, error = %message, "Relay failed");
        }
    }

    // Teardown: the gateway was already closed by `relay`
    drop(permit);
    ctx.registry.remove(&id);
    client.close().await;

    let duration_ms = (chrono::Utc::now() - record.connected_at()).num_milliseconds();
    info!(
        connection_id = %id,
        %peer_addr,
        bytes_from_client = record.bytes_from_client(),
        bytes_to_client = record.bytes_to_client(),
        duration_ms,
        "Client disconnected"
    );

    outcome
}

/// Dial the gateway and run the relay loop, always closing the gateway after
async fn relay(
    client: &mut ClientConnection,
    session: &Session,
    ctx: &RelayContext,
) -> Result<RelayExit, RelayError> {
    let record = client.record().clone();
    let mut gateway = GatewayConnection::new(ctx.gateway.host.clone(), ctx.gateway.port)
        .with_connect_timeout(ctx.gateway.connect_timeout)
        .with_resolver(ctx.resolver.clone());

    let dialed = tokio::select! {
        _ = record.disconnected() => None,
        dialed = gateway.connect() => Some(dialed),
    };
    match dialed {
        None => return Ok(RelayExit::Disconnected),
        Some(dialed) => dialed?,
    }

    debug!(
        connection_id = %record.id(),
        gateway = %format!("{}:{}", gateway.host(), gateway.port()),
        "Gateway connected"
    );

    let result = relay_loop(client, &mut gateway, session, ctx).await;
    gateway.disconnect().await;
    result
}

fn client_closed(record: &ConnectionRecord) -> RelayExit {
    if record.is_disconnect_requested() {
        RelayExit::Disconnected
    } else {
        RelayExit::ClientClosed
    }
}

fn revocation(session: &Session) -> RelayError {
    session
        .violation()
        .unwrap_or_else(|| SecurityViolation {
            connection_id: session.id(),
            reason: "session revoked".to_string(),
        })
        .into()
}

/// Pump both directions concurrently until one of them ends
async fn relay_loop(
    client: &mut ClientConnection,
    gateway: &mut GatewayConnection,
    session: &Session,
    ctx: &RelayContext,
) -> Result<RelayExit, RelayError> {
    let record = client.record().clone();
    let mut state_rx = session.subscribe();

    if client.is_disconnected() {
        return Ok(client_closed(&record));
    }
    if gateway.is_disconnected() {
        return Ok(RelayExit::GatewayClosed);
    }

    let (mut client_rd, mut client_wr) = client.stream_mut().split();
    let (mut gateway_rd, mut gateway_wr) = gateway.stream_mut()?.split();

    let upstream = pump(
        &mut client_rd,
        &mut gateway_wr,
        ctx.chunk_size,
        ctx.limits,
        Leg::Client,
        |n| record.record_from_client(n),
    );
    let downstream = pump(
        &mut gateway_rd,
        &mut client_wr,
        ctx.chunk_size,
        ctx.limits,
        Leg::Gateway,
        |n| record.record_to_client(n),
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    loop {
        if session.is_revoked() {
            return Err(revocation(session));
        }

        tokio::select! {
            biased;
            _ = record.disconnected() => return Ok(RelayExit::Disconnected),
            Ok(()) = state_rx.changed() => continue,
            finished = &mut upstream => {
                // A forced disconnect also surfaces as EOF or an IO error here
                if record.is_disconnect_requested() {
                    return Ok(RelayExit::Disconnected);
                }
                finished?;
                return Ok(client_closed(&record));
            }
            finished = &mut downstream => {
                if record.is_disconnect_requested() {
                    return Ok(RelayExit::Disconnected);
                }
                finished?;
                return Ok(RelayExit::GatewayClosed);
            }
        }
    }
}

/// Copy `src` into `dst` burst after burst until `src` reaches EOF
async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    chunk_size: usize,
    limits: BurstLimits,
    from: Leg,
    count: impl Fn(u64),
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let to = match from {
        Leg::Client => Leg::Gateway,
        Leg::Gateway => Leg::Client,
    };
    let mut buf = vec![0u8; chunk_size];

    loop {
        let burst = copy_burst(src, dst, &mut buf, limits)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => RelayError::transport(from, e),
                CopyError::Write(e) => RelayError::transport(to, e),
            })?;
        count(burst.bytes());
        if let Burst::Eof(_) = burst {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplex::DEFAULT_CHUNK_SIZE;
    use hyperion_connection::{GatewayError, SystemResolver};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn context(gateway: SocketAddr) -> Arc<RelayContext> {
        Arc::new(RelayContext {
            registry: Arc::new(ConnectionRegistry::new()),
            gateway: GatewayTarget::new(gateway.ip().to_string(), gateway.port()),
            resolver: Arc::new(SystemResolver),
            chunk_size: DEFAULT_CHUNK_SIZE,
            limits: BurstLimits::default(),
        })
    }

    async fn echo_gateway() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    /// Accept one loopback client and hand it to a relay task
    async fn spawn_relay(
        ctx: &Arc<RelayContext>,
        disconnect: CancellationToken,
    ) -> (TcpStream, JoinHandle<Result<RelayExit, RelayError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer_addr) = accepted.unwrap();
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let task = tokio::spawn(handle_connection(
            stream,
            peer_addr,
            ctx.clone(),
            disconnect,
            permit,
        ));
        (client.unwrap(), task)
    }

    async fn finish(
        task: JoinHandle<Result<RelayExit, RelayError>>,
    ) -> Result<RelayExit, RelayError> {
        tokio::time::timeout(WAIT, task)
            .await
            .expect("relay task did not finish")
            .unwrap()
    }

    async fn echo(client: &mut TcpStream, payload: &[u8]) {
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(WAIT, client.read_exact(&mut echoed))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(echoed, payload);
    }

    #[allow(deprecated)]
    fn reset_on_drop(stream: &TcpStream) {
        stream.set_linger(Some(Duration::ZERO)).unwrap();
    }

    #[tokio::test]
    async fn test_client_close_ends_with_client_closed() {
        let ctx = context(echo_gateway().await);
        let (mut client, task) = spawn_relay(&ctx, CancellationToken::new()).await;

        echo(&mut client, b"ping").await;
        drop(client);

        assert_eq!(finish(task).await.unwrap(), RelayExit::ClientClosed);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_close_ends_with_gateway_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let ctx = context(gateway);
        let (_client, task) = spawn_relay(&ctx, CancellationToken::new()).await;

        assert_eq!(finish(task).await.unwrap(), RelayExit::GatewayClosed);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_ends_with_security_violation() {
        let ctx = context(echo_gateway().await);
        let (mut client, task) = spawn_relay(&ctx, CancellationToken::new()).await;
        echo(&mut client, b"hello").await;

        let id = ctx.registry.snapshot()[0].record.id();
        ctx.registry.revoke(&id, "forged token").unwrap();

        match finish(task).await {
            Err(RelayError::SecurityViolation(violation)) => {
                assert_eq!(violation.connection_id, id);
                assert_eq!(violation.reason, "forged token");
            }
            other => panic!("expected security violation, got {other:?}"),
        }
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_ends_with_unavailable_backend() {
        let gateway = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let ctx = context(gateway);
        let (_client, task) = spawn_relay(&ctx, CancellationToken::new()).await;

        match finish(task).await {
            Err(RelayError::UnavailableBackend(GatewayError::Unavailable { port, .. })) => {
                assert_eq!(port, gateway.port());
            }
            other => panic!("expected unavailable backend, got {other:?}"),
        }
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_client_reset_ends_with_transport_failure() {
        let ctx = context(echo_gateway().await);
        let (mut client, task) = spawn_relay(&ctx, CancellationToken::new()).await;
        echo(&mut client, b"about to vanish").await;

        reset_on_drop(&client);
        drop(client);

        match finish(task).await {
            Err(RelayError::TransportFailure { leg, .. }) => assert_eq!(leg, Leg::Client),
            other => panic!("expected transport failure, got {other:?}"),
        }
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_server_cancellation_ends_with_disconnected() {
        let ctx = context(echo_gateway().await);
        let shutdown = CancellationToken::new();
        let (mut client, task) = spawn_relay(&ctx, shutdown.child_token()).await;
        echo(&mut client, b"working").await;

        shutdown.cancel();

        assert_eq!(finish(task).await.unwrap(), RelayExit::Disconnected);
        assert!(ctx.registry.is_empty());
    }
}
