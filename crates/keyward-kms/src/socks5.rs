//! SOCKS5 client handshake (RFC 1928, RFC 1929).
//!
//! Only what a KMS tunnel needs: no-auth or username/password method
//! negotiation, then a single CONNECT. The handshake runs over an already
//! connected stream; the same stream carries the TLS session afterwards.

use std::io;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KmsError, KmsResult};

/// Port used when a proxy host is set without a port.
pub const DEFAULT_PROXY_PORT: u16 = 1080;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 proxy settings shared by every KMS request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_password: Option<String>,
}

impl ProxyOptions {
    /// Creates proxy options for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_host: Some(host.into()),
            proxy_port: Some(port),
            ..Self::default()
        }
    }

    /// Adds username/password authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }

    /// Returns the proxy address, or `None` when no proxy is configured.
    pub fn address(&self) -> Option<(&str, u16)> {
        let host = self.proxy_host.as_deref().filter(|h| !h.is_empty())?;
        Some((host, self.proxy_port.unwrap_or(DEFAULT_PROXY_PORT)))
    }

    /// Returns username/password credentials if a username is set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let username = self.proxy_username.as_deref()?;
        Some((username, self.proxy_password.as_deref().unwrap_or_default()))
    }
}

/// Negotiates a tunnel to `host:port` over `stream`.
pub async fn connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> KmsResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[VERSION, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut selection = [0u8; 2];
    read_frame(stream, &mut selection).await?;
    if selection[0] != VERSION {
        return Err(KmsError::Proxy(format!(
            "unexpected SOCKS version {:#04x} in method selection",
            selection[0]
        )));
    }

    match selection[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let (username, password) = credentials.ok_or_else(|| {
                KmsError::Proxy("proxy requires username/password authentication".to_string())
            })?;
            authenticate(stream, username, password).await?;
        }
        METHOD_NONE_ACCEPTABLE => {
            return Err(KmsError::Proxy(
                "no acceptable authentication method".to_string(),
            ));
        }
        other => {
            return Err(KmsError::Proxy(format!(
                "proxy selected unsupported authentication method {other:#04x}"
            )));
        }
    }

    stream.write_all(&connect_request(host, port)?).await?;
    stream.flush().await?;
    read_connect_reply(stream).await
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> KmsResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = field_len(username, "username")?;
    let plen = field_len(password, "password")?;

    let mut frame = Vec::with_capacity(3 + username.len() + password.len());
    frame.push(AUTH_VERSION);
    frame.push(ulen);
    frame.extend_from_slice(username.as_bytes());
    frame.push(plen);
    frame.extend_from_slice(password.as_bytes());
    stream.write_all(&frame).await?;

    let mut status = [0u8; 2];
    read_frame(stream, &mut status).await?;
    if status[1] != 0x00 {
        return Err(KmsError::Proxy(format!(
            "authentication rejected (status {:#04x})",
            status[1]
        )));
    }
    Ok(())
}

fn field_len(value: &str, name: &str) -> KmsResult<u8> {
    u8::try_from(value.len())
        .map_err(|_| KmsError::Proxy(format!("{name} longer than 255 bytes")))
}

/// Encodes the CONNECT request for `host:port`.
fn connect_request(host: &str, port: u16) -> KmsResult<Vec<u8>> {
    let mut frame = vec![VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            frame.push(ATYP_DOMAIN);
            frame.push(field_len(host, "destination host")?);
            frame.extend_from_slice(host.as_bytes());
        }
    }
    frame.extend_from_slice(&port.to_be_bytes());
    Ok(frame)
}

async fn read_connect_reply<S>(stream: &mut S) -> KmsResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_frame(stream, &mut header).await?;
    if header[0] != VERSION {
        return Err(KmsError::Proxy(format!(
            "unexpected SOCKS version {:#04x} in connect reply",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(KmsError::Proxy(reply_message(header[1])));
    }

    // Bound address and port; the tunnel does not need them.
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_frame(stream, &mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(KmsError::Proxy(format!(
                "unknown address type {other:#04x} in connect reply"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_frame(stream, &mut bound).await
}

async fn read_frame<S>(stream: &mut S, buf: &mut [u8]) -> KmsResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(KmsError::Proxy(
            "proxy closed the connection during handshake".to_string(),
        )),
        Err(e) => Err(KmsError::Io(e)),
    }
}

fn reply_message(code: u8) -> String {
    let reason = match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    };
    format!("connect failed: {reason} ({code:#04x})")
}
