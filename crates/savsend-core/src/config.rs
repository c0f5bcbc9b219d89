//! Endpoint configuration.
//!
//! The endpoint file holds exactly two meaningful lines:
//!
//! ```text
//! saves.example.com
//! 4000
//! ```
//!
//! Line 1 is the server hostname and line 2 the decimal port. Surrounding
//! whitespace is stripped from both. Anything after line 2 is ignored.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// Endpoint file name
pub const ENDPOINT_FILE_NAME: &str = "savsender.conf";

/// Remote endpoint to dump to and restore from
///
/// Loaded once at startup and shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from parts
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is blank or `port` is zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort("0".to_string()));
        }
        validate_host(&host)?;

        Ok(Self { host, port })
    }

    /// Parse the two-line endpoint format
    ///
    /// # Errors
    ///
    /// Returns an error if either line is missing, or if the port is not a
    /// base-10 number in `1..=65535`. A non-numeric port is never read as 0.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut lines = contents.lines();

        let host = lines.next().map(str::trim).unwrap_or_default();
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }

        let port = lines.next().map(str::trim).unwrap_or_default();
        if port.is_empty() {
            return Err(ConfigError::MissingPort);
        }

        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port.to_string()))?;

        Self::new(host, port)
    }

    /// Load the endpoint file at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!("Opening endpoint file {}", path.display());

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let endpoint = Self::parse(&contents)?;
        tracing::info!("Server is at {}", endpoint);
        Ok(endpoint)
    }

    /// Server hostname
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.chars().any(char::is_whitespace) || host.contains('/') || host.contains('\\') {
        return Err(ConfigError::Invalid(
            format!("server hostname {host:?} contains invalid characters").into(),
        ));
    }
    Ok(())
}
