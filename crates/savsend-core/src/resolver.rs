//! Endpoint resolution: hostname/port to a connected channel.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::channel::{Channel, TcpChannel};
use crate::config::Endpoint;
use crate::error::ConnectError;

/// Turns an [`Endpoint`] into a connected [`Channel`]
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Resolve and connect.
    ///
    /// # Errors
    /// Returns `ConnectError` if resolution or the connection fails
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ConnectError>;
}

/// TCP resolver using the system resolver
///
/// The first address returned by the lookup is used.
#[derive(Debug, Clone, Default)]
pub struct TcpResolver {
    connect_timeout: Option<Duration>,
}

impl TcpResolver {
    /// Resolver without a connect timeout
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on a connect attempt after `timeout`
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Look up the first address for `endpoint`.
    ///
    /// # Errors
    /// Returns `ConnectError::Resolve` or `ConnectError::NoAddress`
    pub async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr, ConnectError> {
        tracing::info!("Resolving {}...", endpoint.host());

        let mut addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| ConnectError::Resolve {
                host: endpoint.host().to_string(),
                reason: e.to_string(),
            })?;

        let addr = addrs.next().ok_or_else(|| ConnectError::NoAddress {
            host: endpoint.host().to_string(),
        })?;

        tracing::info!("Resolved to {}", addr.ip());
        Ok(addr)
    }
}

#[async_trait]
impl EndpointResolver for TcpResolver {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>, ConnectError> {
        let addr = self.resolve(endpoint).await?;

        tracing::info!("Connecting to server at {}...", addr);
        let connect = TcpStream::connect(addr);
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectError::Timeout { addr, timeout })?,
            None => connect.await,
        }
        .map_err(|source| ConnectError::Connect { addr, source })?;

        let channel = TcpChannel::from_stream(stream)
            .map_err(|source| ConnectError::Connect { addr, source })?;
        Ok(Box::new(channel))
    }
}
