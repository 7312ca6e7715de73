//! Outbound half of an endpoint connection

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RelayError;

/// Write side of a registered endpoint
///
/// Implementations serialize concurrent writers so frames never interleave.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one already-framed record
    async fn send(&self, frame: &[u8]) -> Result<(), RelayError>;

    /// Close the write side; errors are ignored
    async fn shutdown(&self) {}

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// Transport over the write half of a TCP stream
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    peer: String,
    send_timeout: Duration,
}

impl TcpTransport {
    pub fn new(writer: OwnedWriteHalf, peer: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer: peer.into(),
            send_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), RelayError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok::<_, RelayError>(())
        };

        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::SendTimeout {
                ms: self.send_timeout.as_millis() as u64,
            }),
        }
    }

    async fn shutdown(&self) {
        debug!(peer = %self.peer, "TcpTransport::shutdown: called");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_tcp_transport_writes_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let (_read, write) = stream.into_split();
        let transport = TcpTransport::new(write, peer.to_string(), Duration::from_secs(1));

        transport.send(b"{\"type\":\"ping\"}\n").await.unwrap();
        transport.shutdown().await;

        let received = client.await.unwrap();
        assert_eq!(received, b"{\"type\":\"ping\"}\n".to_vec());
        assert_eq!(transport.peer(), peer.to_string());
    }
}
