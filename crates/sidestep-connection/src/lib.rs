//! Outbound connection lifecycle
//!
//! Tracks in-flight and established connections so they can be interrupted
//! en masse, and dials TCP connections that honour a shared dial
//! configuration (timeouts, upstream HTTP proxy, device binding).

pub mod conn;
pub mod dial_config;
pub mod dialer;
pub mod registry;

pub use conn::{CloseHandle, DirectConn, TunnelConn};
pub use dial_config::{DeviceBinder, DialConfig, DialConfigBuilder, SocketDescriptor};
pub use dialer::{DialError, TcpDialer};
pub use registry::{Closeable, ConnRegistry};
