//! HTTP CONNECT tunnel establishment
//!
//! Negotiates a raw byte tunnel to a `host:port` target through an already
//! connected HTTP proxy. No payload bytes may have been exchanged on the
//! connection before calling [`http_proxy_connect`].

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on the proxy's response head (status line plus headers)
const MAX_RESPONSE_HEAD_SIZE: usize = 16 * 1024;

/// Maximum number of headers accepted in the proxy's response
const MAX_RESPONSE_HEADERS: usize = 64;

/// HTTP CONNECT errors
#[derive(Debug, Error)]
pub enum ProxyConnectError {
    #[error("Invalid target address '{0}': missing port or too many colons")]
    InvalidAddress(String),

    #[error("Failed to write CONNECT request: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to read CONNECT response: {0}")]
    Read(#[source] std::io::Error),

    #[error("Malformed CONNECT response: {0}")]
    MalformedResponse(String),

    /// The proxy answered with a non-200 status. Displays as the bare reason
    /// phrase (e.g. `Forbidden`).
    #[error("{reason}")]
    Rejected { status: u16, reason: String },
}

/// Split a `host:port` address into its host and port parts.
///
/// IPv6 hosts must be bracketed (`[::1]:443`); the brackets are removed from
/// the returned host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((host, port));
    }

    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

/// Establish an HTTP CONNECT tunnel to `addr` through `stream`.
///
/// On success the stream carries raw tunneled bytes to `addr`. Only the
/// proxy's response head is consumed; bytes the target sends first stay
/// readable on `stream`.
pub async fn http_proxy_connect<S>(stream: &mut S, addr: &str) -> Result<(), ProxyConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (hostname, _port) =
        split_host_port(addr).ok_or_else(|| ProxyConnectError::InvalidAddress(addr.to_string()))?;

    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nConnection: Keep-Alive\r\n\r\n",
        addr, hostname
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ProxyConnectError::Write)?;
    stream.flush().await.map_err(ProxyConnectError::Write)?;

    let head = read_response_head(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyConnectError::MalformedResponse(
                "incomplete response head".to_string(),
            ))
        }
        Err(e) => return Err(ProxyConnectError::MalformedResponse(e.to_string())),
    }

    let status = response.code.unwrap_or_default();
    if status != 200 {
        let reason = response.reason.unwrap_or_default().to_string();
        debug!("Proxy rejected CONNECT {}: {} {}", addr, status, reason);
        return Err(ProxyConnectError::Rejected { status, reason });
    }

    debug!("CONNECT tunnel established to {}", addr);
    Ok(())
}

/// Read the response head up to and including its terminating blank line.
///
/// Reads one byte at a time so nothing past the head is taken from `stream`:
/// server-first protocols (SSH banners) may already have bytes queued behind
/// the proxy's response.
async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, ProxyConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);

    loop {
        if head.len() >= MAX_RESPONSE_HEAD_SIZE {
            return Err(ProxyConnectError::MalformedResponse(
                "response head too large".to_string(),
            ));
        }

        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProxyConnectError::MalformedResponse(
                    "unexpected EOF".to_string(),
                ))
            }
            Err(e) => return Err(ProxyConnectError::Read(e)),
        };
        head.push(byte);

        if byte != b'\n' {
            continue;
        }
        // An empty first line is not a response
        if head == b"\n" || head == b"\r\n" {
            return Err(ProxyConnectError::MalformedResponse(
                "missing status line".to_string(),
            ));
        }
        if head.ends_with(b"\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
    }
}
