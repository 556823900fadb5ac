//! Non-blocking liveness check for TCP transports

use futures::FutureExt;
use tokio::net::TcpStream;

/// Check whether the peer of `stream` has gone away without blocking.
///
/// Polls a one-byte peek exactly once. A zero-length peek (orderly EOF) or any
/// socket error counts as disconnected; pending data or no readiness at all
/// counts as connected.
pub fn is_disconnected(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).now_or_never() {
        Some(Ok(0)) => true,
        Some(Ok(_)) => false,
        Some(Err(_)) => true,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_idle_connection_is_alive() {
        let (client, _server) = pair().await;
        assert!(!is_disconnected(&client));
    }

    #[tokio::test]
    async fn test_pending_data_is_alive() {
        let (client, mut server) = pair().await;
        server.write_all(b"x").await.unwrap();
        client.readable().await.unwrap();
        assert!(!is_disconnected(&client));
    }

    #[tokio::test]
    async fn test_peer_close_is_disconnected() {
        let (client, server) = pair().await;
        drop(server);

        // Wait for the FIN to arrive
        let mut disconnected = false;
        for _ in 0..50 {
            if is_disconnected(&client) {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disconnected, "liveness check never observed the peer closing");
    }
}
