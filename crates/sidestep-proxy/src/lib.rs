//! Upstream proxy traversal and byte relaying
//!
//! Provides the HTTP CONNECT handshake used to tunnel through an upstream
//! HTTP proxy, and the full-duplex relay used once a tunnel is established.

pub mod connect;
pub mod relay;

pub use connect::{http_proxy_connect, split_host_port, ProxyConnectError};
pub use relay::relay;
