//! KMS transport error types.

use thiserror::Error;

/// Result type for KMS transport operations.
pub type KmsResult<T> = Result<T, KmsError>;

/// Errors that can occur while exchanging a request with a KMS endpoint.
#[derive(Debug, Error)]
pub enum KmsError {
    /// A provider's TLS options enable a mode that weakens verification.
    #[error("Insecure TLS options prohibited for {provider}: {option}")]
    InsecureTlsOption {
        /// The KMS provider the options were configured for.
        provider: String,
        /// The offending option name.
        option: &'static str,
    },

    /// The endpoint could not be split into host and port.
    #[error("invalid KMS endpoint: {0}")]
    InvalidEndpoint(String),

    /// Socket-level failure, including TLS handshake failures surfaced by the stream.
    #[error("KMS request failed: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration could not be built.
    #[error("KMS request failed: TLS error: {0}")]
    Tls(String),

    /// The SOCKS5 proxy refused or broke the tunnel.
    #[error("KMS request failed: SOCKS5 proxy error: {0}")]
    Proxy(String),

    /// The peer closed the connection before the response was complete.
    #[error("KMS request closed")]
    Closed,

    /// A connect or read timeout elapsed.
    #[error("KMS request timed out")]
    TimedOut,

    /// The engine rejected response bytes handed to it.
    #[error("KMS response rejected: {0}")]
    Response(String),
}

impl KmsError {
    /// Returns true if this error was caused by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::TimedOut => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}
