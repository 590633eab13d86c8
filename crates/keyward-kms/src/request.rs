//! The engine's view of a single KMS exchange.

/// A pending KMS request produced by the encryption engine.
///
/// The engine owns response parsing: the transport only shuttles bytes and
/// watches [`bytes_needed`](Self::bytes_needed) to know when to stop reading.
pub trait KmsRequest: Send {
    /// Target endpoint as `host[:port]`.
    fn endpoint(&self) -> &str;

    /// KMS provider identifier, e.g. `aws` or `kmip:primary`.
    fn provider(&self) -> &str;

    /// Request bytes to write once the TLS session is up.
    fn message(&self) -> &[u8];

    /// Number of response bytes the engine still needs. Zero once the response
    /// has been fully parsed.
    fn bytes_needed(&self) -> usize;

    /// Hands received bytes to the engine, which decrements `bytes_needed`.
    ///
    /// The transport never passes more than `bytes_needed` bytes at once. An
    /// `Err` carries the engine's description of a malformed response.
    fn add_response(&mut self, bytes: &[u8]) -> Result<(), String>;
}

/// Parsed `host[:port]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Port used when an endpoint carries no explicit port.
pub const HTTPS_PORT: u16 = 443;

impl Endpoint {
    /// Parses `host`, `host:port`, or `[v6]:port`.
    pub fn parse(endpoint: &str) -> Option<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }

        if let Some(rest) = endpoint.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => HTTPS_PORT,
                None => return None,
            };
            return Some(Self {
                host: host.to_string(),
                port,
            });
        }

        match endpoint.split_once(':') {
            Some((host, port)) if !host.is_empty() => Some(Self {
                host: host.to_string(),
                port: port.parse().ok()?,
            }),
            Some(_) => None,
            None => Some(Self {
                host: endpoint.to_string(),
                port: HTTPS_PORT,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_without_port() {
        let ep = Endpoint::parse("kms.us-east-1.amazonaws.com").unwrap();
        assert_eq!(ep.host, "kms.us-east-1.amazonaws.com");
        assert_eq!(ep.port, HTTPS_PORT);
    }

    #[test]
    fn parses_host_with_port() {
        let ep = Endpoint::parse("localhost:5698").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 5698);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let ep = Endpoint::parse("[::1]:9000").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 9000);
        assert_eq!(Endpoint::parse("[::1]").unwrap().port, HTTPS_PORT);
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(Endpoint::parse("").is_none());
        assert!(Endpoint::parse(":443").is_none());
        assert!(Endpoint::parse("host:notaport").is_none());
        assert!(Endpoint::parse("host:1:2").is_none());
        assert!(Endpoint::parse("[::1").is_none());
    }
}
