//! # keyward-kms: KMS transport for `keyward`
//!
//! Carries opaque request/response bytes between the encryption engine and
//! cloud key-management endpoints.
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────┐   ┌─────────────────┐
//! │ KmsRequest │ → │ TCP / SOCKS5 │ → │ TLS (per  │ → │ ByteAccumulator │ → engine
//! │ (engine)   │   │   tunnel     │   │ provider) │   │ (bytes_needed)  │
//! └────────────┘   └──────────────┘   └───────────┘   └─────────────────┘
//! ```
//!
//! The transport never parses KMS responses. It stops reading exactly when the
//! engine's `bytes_needed` counter reaches zero.

pub mod buffer;
mod error;
pub mod pem;
pub mod request;
pub mod socks5;
pub mod tls;
pub mod transport;

pub use buffer::ByteAccumulator;
pub use error::{KmsError, KmsResult};
pub use request::{Endpoint, HTTPS_PORT, KmsRequest};
pub use socks5::{DEFAULT_PROXY_PORT, ProxyOptions};
pub use tls::KmsTlsOptions;
pub use transport::{KmsTransport, TransportOptions, exchange};
