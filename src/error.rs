use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Spyglass proxy
#[derive(Error, Debug)]
pub enum SpyglassError {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Upstream errors
    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Upstream round trip failed: {0}")]
    UpstreamRoundTrip(String),

    // Tunnel errors
    #[error("Tunnel establishment failed: {0}")]
    TunnelEstablish(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    // Certificate errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Timeouts
    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Spyglass operations
pub type Result<T> = std::result::Result<T, SpyglassError>;

impl SpyglassError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SpyglassError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 502 Bad Gateway
            SpyglassError::UpstreamConnect(_)
            | SpyglassError::UpstreamRoundTrip(_)
            | SpyglassError::TunnelEstablish(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            SpyglassError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            SpyglassError::TlsHandshake(_)
            | SpyglassError::Certificate(_)
            | SpyglassError::InvalidConfig(_)
            | SpyglassError::Io(_)
            | SpyglassError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for SpyglassError {
    fn from(err: hyper::Error) -> Self {
        SpyglassError::Http(err.to_string())
    }
}

// Convert from rcgen errors
impl From<rcgen::Error> for SpyglassError {
    fn from(err: rcgen::Error) -> Self {
        SpyglassError::Certificate(err.to_string())
    }
}
