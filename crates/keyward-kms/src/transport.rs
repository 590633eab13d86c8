//! KMS network transport.
//!
//! One call per [`KmsRequest`]: TCP connect (directly or through a SOCKS5
//! tunnel), TLS upgrade with the provider's options, one write of the request
//! message, then reads until the engine reports that no more bytes are needed.
//!
//! Sockets are owned by the call's stack frame. Every exit path (success,
//! error, timeout, or the caller dropping the future) closes them on drop.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, trace};

use crate::buffer::ByteAccumulator;
use crate::error::{KmsError, KmsResult};
use crate::request::{Endpoint, KmsRequest};
use crate::socks5::{self, ProxyOptions};
use crate::tls::KmsTlsOptions;

const READ_CHUNK_SIZE: usize = 4096;

/// Transport-wide settings, shared read-only by every request.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// SOCKS5 proxy, if any.
    pub proxy: ProxyOptions,
    /// TLS options keyed by KMS provider identifier.
    pub tls: BTreeMap<String, KmsTlsOptions>,
    /// Bound on TCP connect, proxy handshake and TLS handshake, each.
    pub connect_timeout: Option<Duration>,
    /// Bound on each individual socket read.
    pub read_timeout: Option<Duration>,
}

impl TransportOptions {
    /// Sets the SOCKS5 proxy.
    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets TLS options for one provider.
    pub fn with_provider_tls(mut self, provider: impl Into<String>, tls: KmsTlsOptions) -> Self {
        self.tls.insert(provider.into(), tls);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the per-read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Executes KMS requests over TLS.
#[derive(Debug, Clone, Default)]
pub struct KmsTransport {
    options: Arc<TransportOptions>,
}

impl KmsTransport {
    /// Creates a transport with the given options.
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    /// Returns the transport options.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Performs one KMS exchange, returning once `bytes_needed` reaches zero.
    ///
    /// Prohibited TLS options fail before any socket is opened.
    #[instrument(skip_all, fields(provider = request.provider(), endpoint = request.endpoint()))]
    pub async fn request<R>(&self, request: &mut R) -> KmsResult<()>
    where
        R: KmsRequest + ?Sized,
    {
        let tls = match self.options.tls.get(request.provider()) {
            Some(options) => {
                options.validate(request.provider())?;
                options.client_config().await?
            }
            None => KmsTlsOptions::default().client_config().await?,
        };

        let endpoint = Endpoint::parse(request.endpoint())
            .ok_or_else(|| KmsError::InvalidEndpoint(request.endpoint().to_string()))?;
        let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|e| {
            KmsError::Tls(format!("invalid server name {}: {e}", endpoint.host))
        })?;

        let tcp = self.connect(&endpoint).await?;
        let mut stream = bounded(
            self.options.connect_timeout,
            TlsConnector::from(tls).connect(server_name, tcp),
        )
        .await?;
        debug!(host = %endpoint.host, port = endpoint.port, "KMS TLS session established");

        exchange(&mut stream, request, self.options.read_timeout).await?;
        debug!("KMS response complete");
        Ok(())
    }

    async fn connect(&self, endpoint: &Endpoint) -> KmsResult<TcpStream> {
        let limit = self.options.connect_timeout;

        let Some((proxy_host, proxy_port)) = self.options.proxy.address() else {
            return bounded(
                limit,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await;
        };

        let mut tcp = bounded(limit, TcpStream::connect((proxy_host, proxy_port))).await?;
        debug!(proxy_host, proxy_port, "tunneling KMS request through SOCKS5 proxy");

        let handshake = socks5::connect(
            &mut tcp,
            &endpoint.host,
            endpoint.port,
            self.options.proxy.credentials(),
        );
        match limit {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| KmsError::TimedOut)??,
            None => handshake.await?,
        }
        Ok(tcp)
    }
}

/// Writes the request message and feeds response bytes to the engine until it
/// needs no more.
///
/// EOF before completion fails with [`KmsError::Closed`].
pub async fn exchange<S, R>(
    stream: &mut S,
    request: &mut R,
    read_timeout: Option<Duration>,
) -> KmsResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: KmsRequest + ?Sized,
{
    stream.write_all(request.message()).await?;
    stream.flush().await?;

    let mut buffer = ByteAccumulator::new();
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);

    while request.bytes_needed() > 0 {
        chunk.reserve(READ_CHUNK_SIZE);
        let n = bounded(read_timeout, stream.read_buf(&mut chunk)).await?;
        if n == 0 {
            return Err(KmsError::Closed);
        }
        buffer.append(chunk.split().freeze());
        feed(&mut buffer, request)?;
        trace!(received = n, needed = request.bytes_needed(), "KMS response bytes");
    }

    Ok(())
}

/// Hands buffered bytes to the engine, never more than it asks for.
fn feed<R>(buffer: &mut ByteAccumulator, request: &mut R) -> KmsResult<()>
where
    R: KmsRequest + ?Sized,
{
    while request.bytes_needed() > 0 && !buffer.is_empty() {
        let size = request.bytes_needed().min(buffer.len());
        let bytes = buffer.read(size);
        request.add_response(&bytes).map_err(KmsError::Response)?;
    }
    Ok(())
}

async fn bounded<F, T>(limit: Option<Duration>, fut: F) -> KmsResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| KmsError::TimedOut)?
            .map_err(KmsError::Io),
        None => fut.await.map_err(KmsError::Io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    struct ScriptedRequest {
        endpoint: String,
        provider: String,
        message: Vec<u8>,
        needed: usize,
        received: Vec<u8>,
        largest_feed: usize,
    }

    impl ScriptedRequest {
        fn new(needed: usize) -> Self {
            Self {
                endpoint: "kms.local:443".to_string(),
                provider: "aws".to_string(),
                message: b"POST / HTTP/1.1\r\n\r\n".to_vec(),
                needed,
                received: Vec::new(),
                largest_feed: 0,
            }
        }
    }

    impl KmsRequest for ScriptedRequest {
        fn endpoint(&self) -> &str {
            &self.endpoint
        }
        fn provider(&self) -> &str {
            &self.provider
        }
        fn message(&self) -> &[u8] {
            &self.message
        }
        fn bytes_needed(&self) -> usize {
            self.needed
        }
        fn add_response(&mut self, bytes: &[u8]) -> Result<(), String> {
            if bytes.len() > self.needed {
                return Err(format!("fed {} bytes, needed {}", bytes.len(), self.needed));
            }
            self.needed -= bytes.len();
            self.largest_feed = self.largest_feed.max(bytes.len());
            self.received.extend_from_slice(bytes);
            Ok(())
        }
    }

    #[tokio::test]
    async fn exchange_writes_message_and_completes_at_zero() {
        let (mut client, mut server) = duplex(1024);
        let mut request = ScriptedRequest::new(10);

        let kms = tokio::spawn(async move {
            let mut msg = vec![0u8; 19];
            server.read_exact(&mut msg).await.unwrap();
            assert_eq!(msg, b"POST / HTTP/1.1\r\n\r\n");
            for part in [&b"0123"[..], b"4567", b"89"] {
                server.write_all(part).await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });

        exchange(&mut client, &mut request, None).await.unwrap();
        assert_eq!(request.bytes_needed(), 0);
        assert_eq!(request.received, b"0123456789");
        drop(kms.await.unwrap());
    }

    #[tokio::test]
    async fn partial_response_leaves_request_pending() {
        let (mut client, mut server) = duplex(4096);
        let mut request = ScriptedRequest::new(500);

        server.write_all(&[7u8; 300]).await.unwrap();
        let pending = tokio::time::timeout(
            Duration::from_millis(100),
            exchange(&mut client, &mut request, None),
        )
        .await;
        assert!(pending.is_err(), "exchange must wait for the remaining bytes");
    }

    #[tokio::test]
    async fn surplus_bytes_are_never_fed() {
        let (mut client, mut server) = duplex(4096);
        let mut request = ScriptedRequest::new(8);

        server.write_all(&[1u8; 32]).await.unwrap();
        exchange(&mut client, &mut request, None).await.unwrap();

        assert_eq!(request.received.len(), 8);
        assert!(request.largest_feed <= 8);
    }

    #[tokio::test]
    async fn eof_before_completion_is_closed() {
        let (mut client, mut server) = duplex(1024);
        let mut request = ScriptedRequest::new(10);

        tokio::spawn(async move {
            let mut msg = vec![0u8; 19];
            server.read_exact(&mut msg).await.unwrap();
            server.write_all(b"abc").await.unwrap();
        });

        let err = exchange(&mut client, &mut request, None).await.unwrap_err();
        assert!(matches!(err, KmsError::Closed));
        assert_eq!(request.bytes_needed(), 7);
    }

    #[tokio::test]
    async fn read_timeout_fails_request() {
        let (mut client, _server) = duplex(1024);
        let mut request = ScriptedRequest::new(10);

        let err = exchange(&mut client, &mut request, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn insecure_tls_fails_before_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = KmsTransport::new(TransportOptions::default().with_provider_tls(
            "azure",
            KmsTlsOptions {
                tls_allow_invalid_hostnames: Some(true),
                ..KmsTlsOptions::default()
            },
        ));
        let mut request = ScriptedRequest::new(10);
        request.provider = "azure".to_string();
        request.endpoint = format!("127.0.0.1:{}", addr.port());

        let err = transport.request(&mut request).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Insecure TLS options prohibited for azure: tlsAllowInvalidHostnames"
        );

        let accepted =
            tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err(), "no socket may be opened");
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let transport = KmsTransport::default();
        let mut request = ScriptedRequest::new(1);
        request.endpoint = "kms.local:http".to_string();

        let err = transport.request(&mut request).await.unwrap_err();
        assert!(matches!(err, KmsError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = KmsTransport::default();
        let mut request = ScriptedRequest::new(1);
        request.endpoint = format!("127.0.0.1:{port}");

        let err = transport.request(&mut request).await.unwrap_err();
        assert!(matches!(err, KmsError::Io(_)));
    }
}
