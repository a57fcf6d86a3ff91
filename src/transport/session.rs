//! Long-lived session channel over any async byte stream.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use super::Channel;
use crate::core::codec::FrameCodec;
use crate::error::{ProtocolError, Result};

/// Framed channel over a split byte stream.
///
/// Reads and writes take independent locks so the read loop never blocks
/// senders. `close` trips a cancellation token that every pending `read`
/// and `send` selects on.
pub struct SessionChannel<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, FrameCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, FrameCodec>>,
    closed: CancellationToken,
    peer: String,
}

impl<S> SessionChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, FrameCodec)),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec)),
            closed: CancellationToken::new(),
            peer: peer.into(),
        }
    }
}

impl SessionChannel<TcpStream> {
    /// Open a TCP connection. Failure is final for this attempt.
    #[instrument]
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            ProtocolError::TransportError(format!(
                "{}: {address}: {e}",
                crate::error::constants::ERR_CHANNEL_OPEN_FAILED
            ))
        })?;
        stream.set_nodelay(true)?;
        debug!(%address, "Session channel connected");
        Ok(Self::from_tcp(stream))
    }

    /// Wrap an accepted TCP connection.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr: SocketAddr| addr.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        Self::new(stream, peer)
    }
}

#[async_trait]
impl<S> Channel for SessionChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            sent = writer.send(Bytes::copy_from_slice(frame)) => {
                trace!(peer = %self.peer, bytes = frame.len(), "Frame sent");
                sent
            }
        }
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    trace!(peer = %self.peer, bytes = frame.len(), "Frame received");
                    Ok(Some(frame.to_vec()))
                }
                Some(Err(e)) => Err(e),
                None => {
                    debug!(peer = %self.peer, "Peer closed the stream");
                    self.closed.cancel();
                    Ok(None)
                }
            },
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        // Flush and shut down the write half so the peer observes end-of-stream.
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        debug!(peer = %self.peer, "Session channel closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pair() -> (SessionChannel<tokio::io::DuplexStream>, SessionChannel<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (SessionChannel::new(a, "a"), SessionChannel::new(b, "b"))
    }

    #[tokio::test]
    async fn test_frames_arrive_whole_and_in_order() {
        let (a, b) = pair();
        a.send(b"first").await.unwrap();
        a.send(b"").await.unwrap();
        a.send(&[0xFF; 1000]).await.unwrap();

        assert_eq!(b.read().await.unwrap().unwrap(), b"first");
        assert_eq!(b.read().await.unwrap().unwrap(), b"");
        assert_eq!(b.read().await.unwrap().unwrap(), vec![0xFF; 1000]);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = pair();
        let a = Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read must unblock after close")
            .unwrap();
        assert!(matches!(result, Ok(None)));
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_is_end_of_stream() {
        let (a, b) = pair();
        a.close().await;
        assert!(matches!(b.read().await, Ok(None)));
        assert!(matches!(a.send(b"late").await, Err(ProtocolError::ConnectionClosed)));
    }
}
