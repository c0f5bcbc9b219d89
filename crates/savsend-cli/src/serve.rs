//! Remote counterpart for manual round trips.
//!
//! Accepts a single connection and either stores everything the peer sends
//! until it closes (the other end of a dump) or streams a save file back and
//! closes (the other end of a restore).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// What the server does with its one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeMode {
    /// Write everything received to this file
    Store(PathBuf),
    /// Send the contents of this file
    Serve(PathBuf),
}

/// Bind, accept one peer and handle it
///
/// Returns the number of bytes moved.
///
/// # Errors
///
/// Returns an error if binding, accepting or file I/O fails.
pub async fn run(bind: &str, mode: &ServeMode) -> anyhow::Result<u64> {
    let listener = TcpListener::bind(bind).await?;
    let local = listener.local_addr()?;
    tracing::info!("Listening on {}", local);
    println!("Listening on {local}");

    handle_one(&listener, mode).await
}

/// Accept one peer on `listener` and handle it
///
/// # Errors
///
/// Returns an error if accepting or file I/O fails.
pub async fn handle_one(listener: &TcpListener, mode: &ServeMode) -> anyhow::Result<u64> {
    let (mut stream, peer) = listener.accept().await?;
    tracing::info!("Accepted connection from {}", peer);

    let moved = match mode {
        ServeMode::Store(path) => {
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await?;
            tokio::fs::write(path, &received).await?;
            log_done(peer, "Stored", received.len(), path);
            received.len()
        }
        ServeMode::Serve(path) => {
            let contents = tokio::fs::read(path).await?;
            stream.write_all(&contents).await?;
            stream.shutdown().await?;
            log_done(peer, "Served", contents.len(), path);
            contents.len()
        }
    };

    Ok(moved as u64)
}

fn log_done(peer: SocketAddr, what: &str, bytes: usize, path: &Path) {
    tracing::info!(%peer, "{} {} bytes ({})", what, bytes, path.display());
}
