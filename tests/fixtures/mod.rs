//! Save server fixture for integration testing
//!
//! A one-shot TCP peer on loopback playing the remote side of a session:
//! it either collects a dump or feeds a restore, optionally misbehaving.
//!
//! # Example
//!
//! ```no_run
//! use savsend_integration_tests::fixtures::SaveServer;
//!
//! # async fn demo() {
//! let server = SaveServer::store().await.unwrap();
//! let endpoint = server.endpoint();
//! // ... dump to `endpoint` ...
//! let received = server.finish().await.unwrap();
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use savsend_core::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How long a fixture waits for its one peer
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Behaviour of the server once a peer connects
#[derive(Debug, Clone)]
enum Script {
    /// Read until the peer closes
    Store,
    /// Write `data` in pieces of at most `piece` bytes, then close
    Serve { data: Vec<u8>, piece: usize },
    /// Keep the connection open without sending, until the peer closes
    Silent,
}

/// One-shot loopback save server
pub struct SaveServer {
    addr: SocketAddr,
    handle: JoinHandle<io::Result<Vec<u8>>>,
}

impl SaveServer {
    /// Server that records everything a dump sends
    pub async fn store() -> io::Result<Self> {
        Self::start(Script::Store).await
    }

    /// Server that streams `data` to a restoring peer
    pub async fn serve(data: Vec<u8>) -> io::Result<Self> {
        let piece = data.len().max(1);
        Self::start(Script::Serve { data, piece }).await
    }

    /// Server that streams `data` in tiny writes, forcing short reads
    pub async fn serve_trickle(data: Vec<u8>, piece: usize) -> io::Result<Self> {
        Self::start(Script::Serve { data, piece }).await
    }

    /// Server that sends only the first `cut` bytes of `data`, then closes
    pub async fn serve_truncated(mut data: Vec<u8>, cut: usize) -> io::Result<Self> {
        data.truncate(cut);
        Self::serve(data).await
    }

    /// Server that accepts a restore and then never sends a byte
    pub async fn silent() -> io::Result<Self> {
        Self::start(Script::Silent).await
    }

    async fn start(script: Script) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            let (stream, peer) = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no peer connected"))??;
            tracing::debug!("Fixture accepted {}", peer);
            run_script(stream, script).await
        });

        Ok(Self { addr, handle })
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint pointing at this server
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.ip().to_string(), self.addr.port())
            .expect("loopback endpoint is valid")
    }

    /// Wait for the session to end; returns the bytes stored, or the bytes
    /// served
    pub async fn finish(self) -> io::Result<Vec<u8>> {
        self.handle
            .await
            .map_err(|e| io::Error::other(e.to_string()))?
    }
}

async fn run_script(mut stream: TcpStream, script: Script) -> io::Result<Vec<u8>> {
    match script {
        Script::Store | Script::Silent => {
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await?;
            Ok(received)
        }
        Script::Serve { data, piece } => {
            for chunk in data.chunks(piece) {
                stream.write_all(chunk).await?;
                stream.flush().await?;
                if piece < data.len() {
                    tokio::task::yield_now().await;
                }
            }
            stream.shutdown().await?;
            Ok(data)
        }
    }
}

/// A loopback port with nothing listening on it
pub async fn refused_endpoint() -> io::Result<Endpoint> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Endpoint::new("127.0.0.1", port).map_err(|e| io::Error::other(e.to_string()))
}
