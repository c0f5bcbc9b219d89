//! Connected byte-stream abstraction.
//!
//! A [`Channel`] is one ordered, bidirectional stream to the remote endpoint.
//! Each call moves *up to* the requested number of bytes; a short count is
//! normal and the caller is expected to ask again for the rest. A count of
//! zero means the peer closed the stream.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel was closed locally
    #[error("channel is closed")]
    Closed,
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A connected, ordered byte stream.
///
/// # Examples
///
/// ```no_run
/// use savsend_core::channel::{Channel, TcpChannel};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut channel = TcpChannel::connect("127.0.0.1:4000".parse()?).await?;
///
/// let sent = channel.send(b"save data").await?;
/// println!("peer accepted {} bytes", sent);
///
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Channel: Send {
    /// Send up to `buf.len()` bytes.
    ///
    /// # Returns
    /// The number of bytes accepted; may be less than `buf.len()`
    ///
    /// # Errors
    /// Returns `ChannelError` if the stream failed
    async fn send(&mut self, buf: &[u8]) -> ChannelResult<usize>;

    /// Receive up to `buf.len()` bytes.
    ///
    /// # Returns
    /// The number of bytes written to the front of `buf`; zero when the peer
    /// has closed the stream
    ///
    /// # Errors
    /// Returns `ChannelError` if the stream failed
    async fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<usize>;

    /// Close the channel.
    ///
    /// Subsequent operations return `ChannelError::Closed`.
    ///
    /// # Errors
    /// Returns `ChannelError` if the shutdown could not be delivered
    async fn close(&mut self) -> ChannelResult<()>;

    /// Byte counters for this channel.
    fn stats(&self) -> ChannelStats {
        ChannelStats::default()
    }
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Box<C> {
    async fn send(&mut self, buf: &[u8]) -> ChannelResult<usize> {
        (**self).send(buf).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        (**self).recv(buf).await
    }

    async fn close(&mut self) -> ChannelResult<()> {
        (**self).close().await
    }

    fn stats(&self) -> ChannelStats {
        (**self).stats()
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Number of completed send calls
    pub sends: u64,
    /// Number of completed recv calls
    pub recvs: u64,
    /// Calls that moved fewer bytes than requested
    pub short_calls: u64,
}

impl ChannelStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, requested: usize, sent: usize) {
        self.bytes_sent += sent as u64;
        self.sends += 1;
        if sent < requested {
            self.short_calls += 1;
        }
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, requested: usize, received: usize) {
        self.bytes_received += received as u64;
        self.recvs += 1;
        if received < requested {
            self.short_calls += 1;
        }
    }
}

/// TCP channel over a Tokio stream.
///
/// Every `send`/`recv` maps to exactly one `write`/`read` on the socket so
/// short counts reach the transfer engine unchanged.
pub struct TcpChannel {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
    stats: ChannelStats,
}

impl TcpChannel {
    /// Connect to `addr`.
    ///
    /// # Errors
    /// Returns the connect error from the OS
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream.
    ///
    /// # Errors
    /// Returns an error if the peer address cannot be determined
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        // Chunks are small; do not hold them back waiting for more data.
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer,
            closed: false,
            stats: ChannelStats::new(),
        })
    }

    /// Remote address of this channel
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&mut self, buf: &[u8]) -> ChannelResult<usize> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let sent = self.stream.write(buf).await?;
        self.stats.record_send(buf.len(), sent);
        Ok(sent)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> ChannelResult<usize> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        let received = self.stream.read(buf).await?;
        self.stats.record_recv(buf.len(), received);
        Ok(received)
    }

    async fn close(&mut self) -> ChannelResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        tracing::debug!("Closing channel to {}", self.peer);
        self.stream.shutdown().await?;
        Ok(())
    }

    fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_channel_stats() {
        let mut stats = ChannelStats::new();
        assert_eq!(stats.bytes_sent, 0);

        stats.record_send(256, 256);
        assert_eq!(stats.bytes_sent, 256);
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.short_calls, 0);

        stats.record_recv(256, 100);
        assert_eq!(stats.bytes_received, 100);
        assert_eq!(stats.recvs, 1);
        assert_eq!(stats.short_calls, 1);
    }

    #[test]
    fn test_channel_error_display() {
        assert_eq!(ChannelError::Closed.to_string(), "channel is closed");

        let err = ChannelError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(err.to_string().starts_with("I/O error"));
    }

    #[tokio::test]
    async fn test_tcp_channel_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut channel = TcpChannel::connect(addr).await.unwrap();
        assert_eq!(channel.peer_addr(), addr);

        let mut sent = 0;
        while sent < 5 {
            sent += channel.send(&b"hello"[sent..]).await.unwrap();
        }

        let mut buf = [0u8; 5];
        let mut received = 0;
        while received < 5 {
            let n = channel.recv(&mut buf[received..]).await.unwrap();
            assert!(n > 0);
            received += n;
        }
        assert_eq!(&buf, b"hello");

        server.await.unwrap();

        // Server dropped its end
        assert_eq!(channel.recv(&mut buf).await.unwrap(), 0);

        let stats = channel.stats();
        assert_eq!(stats.bytes_sent, 5);
        assert_eq!(stats.bytes_received, 5);
    }

    #[tokio::test]
    async fn test_tcp_channel_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut channel = TcpChannel::connect(addr).await.unwrap();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert!(matches!(
            channel.send(b"late").await,
            Err(ChannelError::Closed)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            channel.recv(&mut buf).await,
            Err(ChannelError::Closed)
        ));

        accept.await.unwrap();
    }
}
