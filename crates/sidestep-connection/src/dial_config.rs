//! Dial configuration shared by every outbound connection attempt

use std::sync::Arc;
use std::time::Duration;

use crate::registry::ConnRegistry;

/// Raw socket descriptor handed to a [`DeviceBinder`]
#[cfg(unix)]
pub type SocketDescriptor = std::os::fd::RawFd;

/// Raw socket descriptor handed to a [`DeviceBinder`]
#[cfg(windows)]
pub type SocketDescriptor = std::os::windows::io::RawSocket;

/// Binds sockets to a network interface outside of VPN routing.
///
/// The host platform supplies the implementation. Binding cannot fail
/// observably: implementations log their own failures.
pub trait DeviceBinder: Send + Sync {
    fn bind_to_device(&self, descriptor: SocketDescriptor);
}

/// Parameters controlling how a dialer connects.
///
/// Built once per fetch or connect attempt and shared, read-only, by every
/// concurrent dial made for that attempt.
pub struct DialConfig {
    /// HTTP proxy (supporting CONNECT) to reach targets through, as `host:port`
    pub upstream_http_proxy_address: Option<String>,

    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    /// Registry that pending dials join so they can be interrupted with
    /// [`ConnRegistry::close_all`]
    pub pending_conns: Arc<ConnRegistry>,

    /// When set, every socket is submitted for device binding before connecting
    pub device_binder: Option<Arc<dyn DeviceBinder>>,

    /// DNS server used for requests bound with the device binder
    pub device_binder_dns_server: Option<String>,
}

impl DialConfig {
    pub fn builder(pending_conns: Arc<ConnRegistry>) -> DialConfigBuilder {
        DialConfigBuilder {
            config: DialConfig {
                upstream_http_proxy_address: None,
                connect_timeout: None,
                read_timeout: None,
                write_timeout: None,
                pending_conns,
                device_binder: None,
                device_binder_dns_server: None,
            },
        }
    }
}

impl std::fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialConfig")
            .field(
                "upstream_http_proxy_address",
                &self.upstream_http_proxy_address,
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("pending_conns", &self.pending_conns)
            .field("device_binder", &self.device_binder.is_some())
            .field("device_binder_dns_server", &self.device_binder_dns_server)
            .finish()
    }
}

/// Builder for DialConfig
pub struct DialConfigBuilder {
    config: DialConfig,
}

impl DialConfigBuilder {
    pub fn upstream_http_proxy_address(mut self, address: Option<String>) -> Self {
        self.config.upstream_http_proxy_address = address.filter(|a| !a.is_empty());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    pub fn device_binder(mut self, binder: Option<Arc<dyn DeviceBinder>>) -> Self {
        self.config.device_binder = binder;
        self
    }

    pub fn device_binder_dns_server(mut self, server: Option<String>) -> Self {
        self.config.device_binder_dns_server = server;
        self
    }

    pub fn build(self) -> Arc<DialConfig> {
        Arc::new(self.config)
    }
}
