//! TCP dialer honouring a [`DialConfig`]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use sidestep_proxy::{http_proxy_connect, ProxyConnectError};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::conn::{CloseHandle, DirectConn, TunnelConn};
use crate::dial_config::{DialConfig, SocketDescriptor};

/// Dial errors
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddress(String),

    #[error("Failed to create socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Dial interrupted")]
    Interrupted,

    #[error("Connect to {0} timed out")]
    Timeout(SocketAddr),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("CONNECT through proxy {proxy} failed: {source}")]
    ProxyConnect {
        proxy: String,
        #[source]
        source: ProxyConnectError,
    },
}

/// Dials TCP connections, directly or through the configured upstream proxy.
///
/// Each dial registers its connection with the config's pending registry
/// for the whole establishment (connect plus CONNECT handshake), so
/// [`crate::ConnRegistry::close_all`] interrupts it at any point.
#[derive(Clone, Debug)]
pub struct TcpDialer {
    config: Arc<DialConfig>,
}

impl TcpDialer {
    pub fn new(config: Arc<DialConfig>) -> Self {
        Self { config }
    }

    /// Dial `addr` (`host:port`).
    pub async fn dial(&self, addr: &str) -> Result<DirectConn, DialError> {
        let handle = CloseHandle::new();
        if !self.config.pending_conns.add(&handle) {
            debug!("Dial to {} refused: pending connections closed", addr);
            return Err(DialError::Interrupted);
        }

        let result = self.establish(addr, handle.clone()).await;
        self.config.pending_conns.remove(&handle);
        result
    }

    async fn establish(
        &self,
        addr: &str,
        handle: Arc<CloseHandle>,
    ) -> Result<DirectConn, DialError> {
        let proxy = self.config.upstream_http_proxy_address.as_deref();
        let dial_addr = proxy.unwrap_or(addr);

        let stream = interruptible(&handle, self.connect(dial_addr)).await?;
        let mut conn = DirectConn::new(
            stream,
            handle.clone(),
            self.config.read_timeout,
            self.config.write_timeout,
        );

        if let Some(proxy) = proxy {
            if let Err(source) = http_proxy_connect(&mut conn, addr).await {
                let interrupted = conn.is_closed();
                conn.close();
                if interrupted {
                    return Err(DialError::Interrupted);
                }
                return Err(DialError::ProxyConnect {
                    proxy: proxy.to_string(),
                    source,
                });
            }
            debug!("Connected to {} through proxy {}", addr, proxy);
        } else {
            debug!("Connected to {}", addr);
        }

        Ok(conn)
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, DialError> {
        let remote = resolve(addr).await?;

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(DialError::Socket)?;

        if let Some(binder) = &self.config.device_binder {
            binder.bind_to_device(socket_descriptor(&socket));
        }

        let connect = socket.connect(remote);
        let result = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| DialError::Timeout(remote))?,
            None => connect.await,
        };
        result.map_err(|source| DialError::Connect {
            address: remote,
            source,
        })
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, DialError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| DialError::Resolve {
            address: addr.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| DialError::NoAddress(addr.to_string()))
}

/// Run `fut` unless `handle` is closed first.
async fn interruptible<T, F>(handle: &CloseHandle, fut: F) -> Result<T, DialError>
where
    F: Future<Output = Result<T, DialError>>,
{
    tokio::select! {
        biased;
        _ = handle.closed() => Err(DialError::Interrupted),
        result = fut => result,
    }
}

#[cfg(unix)]
fn socket_descriptor(socket: &TcpSocket) -> SocketDescriptor {
    use std::os::fd::AsRawFd;
    socket.as_raw_fd()
}

#[cfg(windows)]
fn socket_descriptor(socket: &TcpSocket) -> SocketDescriptor {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket()
}
