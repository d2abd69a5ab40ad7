//! Error types for the proxy

use std::io;
use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while issuing certificates or relaying traffic
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Root CA or leaf certificate construction, parsing or encoding failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The origin could not be reached or its response could not be read
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The inbound connection cannot be taken over for a CONNECT tunnel
    #[error("Connection hijacking is not supported on this connection")]
    HijackUnsupported,

    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }
}

impl From<rcgen::Error> for Error {
    fn from(value: rcgen::Error) -> Self {
        Error::Certificate(value.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(value: rustls::Error) -> Self {
        Error::Tls(value.to_string())
    }
}
