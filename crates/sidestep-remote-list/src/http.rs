//! Minimal HTTP(S) GET over connections made by [`TcpDialer`]
//!
//! Dialing through the dialer means the fetch is interruptible through the
//! pending connection registry, uses the upstream proxy, and has its socket
//! device-bound, exactly like tunnel dials.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use sidestep_connection::{DialError, TcpDialer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// HTTP fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Failed to build request: {0}")]
    Request(#[from] http::Error),

    #[error("Unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Target of a GET request
struct Target {
    https: bool,
    host: String,
    authority: String,
    dial_addr: String,
    path: String,
}

fn parse_target(url: &str) -> Result<Target, FetchError> {
    let invalid = |reason: &str| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
        invalid(&e.to_string())
    })?;

    let https = match uri.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        Some(_) => return Err(invalid("unsupported scheme")),
        None => return Err(invalid("missing scheme")),
    };
    let authority = uri
        .authority()
        .ok_or_else(|| invalid("missing host"))?
        .as_str()
        .to_string();
    let host = uri.host().ok_or_else(|| invalid("missing host"))?;
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();

    Ok(Target {
        https,
        // IPv6 literals come back bracketed from Uri::host
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        authority,
        dial_addr: format!("{}:{}", host, port),
        path,
    })
}

/// GET `url` and return the full response body.
///
/// Any status other than 2xx is an error.
pub async fn http_get(dialer: &TcpDialer, url: &str) -> Result<Bytes, FetchError> {
    let target = parse_target(url)?;
    let conn = dialer.dial(&target.dial_addr).await?;

    let request = Request::builder()
        .method(Method::GET)
        .uri(target.path.as_str())
        .header(
            HOST,
            HeaderValue::from_str(&target.authority).map_err(http::Error::from)?,
        )
        .header(USER_AGENT, concat!("sidestep/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())?;

    if target.https {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|e| FetchError::Tls(e.to_string()))?;
        let tls = tls_connector()
            .connect(server_name, conn)
            .await
            .map_err(|e| FetchError::Tls(e.to_string()))?;
        send(tls, request).await
    } else {
        send(conn, request).await
    }
}

async fn send<S>(stream: S, request: Request<Empty<Bytes>>) -> Result<Bytes, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("HTTP connection closed: {}", e);
        }
    });

    let response = sender.send_request(request).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let body = response.into_body().collect().await?.to_bytes();
    debug!("Fetched {} bytes ({})", body.len(), status);
    Ok(body)
}

fn tls_connector() -> TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsConnector::from(Arc::new(config))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
