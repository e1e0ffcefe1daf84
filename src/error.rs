use std::io;
use thiserror::Error;

/// Unified error type for the proxy
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum GeoProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Geolocation lookup error
    #[error("Geolocation error: {0}")]
    Geolocation(String),

    /// PROXY protocol error
    #[error("PROXY protocol error: {0}")]
    ProxyProtocol(String),

    /// Network connection error
    #[error("Network connection error: {0}")]
    Connection(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GeoProxyError>;

impl From<anyhow::Error> for GeoProxyError {
    fn from(err: anyhow::Error) -> Self {
        GeoProxyError::Other(err.to_string())
    }
}

impl From<serde_yaml::Error> for GeoProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        GeoProxyError::Config(format!("YAML parse error: {}", err))
    }
}
