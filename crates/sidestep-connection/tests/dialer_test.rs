//! Dialer integration tests over loopback
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sidestep_connection::{
    ConnRegistry, DeviceBinder, DialConfig, DialError, SocketDescriptor, TcpDialer, TunnelConn,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, handle)
}

/// Upstream proxy that answers one CONNECT with `status_line`, then echoes.
async fn mock_proxy(
    status_line: &'static str,
) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        while !request.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(format!("{}\r\n\r\n", status_line).as_bytes())
            .await
            .unwrap();
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        String::from_utf8(request).unwrap()
    });
    (addr, handle)
}

#[derive(Default)]
struct RecordingBinder {
    calls: AtomicUsize,
}

impl DeviceBinder for RecordingBinder {
    fn bind_to_device(&self, _descriptor: SocketDescriptor) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_direct_dial() {
    let (addr, _server) = echo_server().await;
    let registry = Arc::new(ConnRegistry::new());
    let dialer = TcpDialer::new(
        DialConfig::builder(registry.clone())
            .connect_timeout(Duration::from_secs(5))
            .build(),
    );

    let mut conn = dialer.dial(&addr).await.unwrap();

    // Deregistered once established
    assert!(registry.is_empty());

    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_dial_with_closed_registry_is_interrupted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let registry = Arc::new(ConnRegistry::new());
    registry.close_all();
    let dialer = TcpDialer::new(DialConfig::builder(registry.clone()).build());

    let err = dialer.dial(&addr).await.unwrap_err();

    assert!(matches!(err, DialError::Interrupted));
    // No connection attempt reached the listener
    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err());
}

#[tokio::test]
async fn test_dial_after_reset_succeeds() {
    let (addr, _server) = echo_server().await;
    let registry = Arc::new(ConnRegistry::new());
    registry.close_all();
    registry.reset();
    let dialer = TcpDialer::new(DialConfig::builder(registry).build());

    assert!(dialer.dial(&addr).await.is_ok());
}

#[tokio::test]
async fn test_dial_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    let registry = Arc::new(ConnRegistry::new());
    let dialer = TcpDialer::new(DialConfig::builder(registry.clone()).build());

    let err = dialer.dial(&addr).await.unwrap_err();

    assert!(matches!(err, DialError::Connect { .. }));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_dial_submits_socket_to_device_binder() {
    let (addr, _server) = echo_server().await;
    let binder = Arc::new(RecordingBinder::default());
    let dialer = TcpDialer::new(
        DialConfig::builder(Arc::new(ConnRegistry::new()))
            .device_binder(Some(binder.clone() as Arc<dyn DeviceBinder>))
            .build(),
    );

    dialer.dial(&addr).await.unwrap();

    assert_eq!(binder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dial_through_upstream_proxy() {
    let (proxy_addr, proxy) = mock_proxy("HTTP/1.1 200 Connection Established").await;
    let dialer = TcpDialer::new(
        DialConfig::builder(Arc::new(ConnRegistry::new()))
            .upstream_http_proxy_address(Some(proxy_addr))
            .build(),
    );

    // The target is never resolved locally; only the proxy is dialed
    let mut conn = dialer.dial("server.invalid:443").await.unwrap();

    conn.write_all(b"tunneled").await.unwrap();
    let mut buf = [0u8; 8];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunneled");
    drop(conn);

    let request = proxy.await.unwrap();
    assert_eq!(
        request,
        "CONNECT server.invalid:443 HTTP/1.1\r\nHost: server.invalid\r\nConnection: Keep-Alive\r\n\r\n"
    );
}

#[tokio::test]
async fn test_dial_through_rejecting_proxy() {
    let (proxy_addr, _proxy) = mock_proxy("HTTP/1.1 403 Forbidden").await;
    let registry = Arc::new(ConnRegistry::new());
    let dialer = TcpDialer::new(
        DialConfig::builder(registry.clone())
            .upstream_http_proxy_address(Some(proxy_addr))
            .build(),
    );

    let err = dialer.dial("server.invalid:443").await.unwrap_err();

    match err {
        DialError::ProxyConnect { source, .. } => assert_eq!(source.to_string(), "Forbidden"),
        other => panic!("unexpected error: {}", other),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_close_all_interrupts_stalled_proxy_handshake() {
    // A proxy that accepts but never answers the CONNECT
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap().to_string();
    let _proxy = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let registry = Arc::new(ConnRegistry::new());
    let dialer = TcpDialer::new(
        DialConfig::builder(registry.clone())
            .upstream_http_proxy_address(Some(proxy_addr))
            .build(),
    );

    let dial = tokio::spawn(async move { dialer.dial("server.invalid:443").await });

    // Wait for the dial to be in flight
    for _ in 0..100 {
        if !registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.close_all();

    let result = tokio::time::timeout(Duration::from_secs(5), dial)
        .await
        .expect("dial was not interrupted")
        .unwrap();
    assert!(matches!(result, Err(DialError::Interrupted)));
}

#[tokio::test]
async fn test_closed_signal_on_dialed_conn() {
    let (addr, _server) = echo_server().await;
    let dialer = TcpDialer::new(DialConfig::builder(Arc::new(ConnRegistry::new())).build());
    let conn = dialer.dial(&addr).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    assert!(conn.set_closed_signal(tx));
    conn.close();

    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("close signal not delivered")
        .unwrap();

    let (late_tx, _late_rx) = tokio::sync::oneshot::channel();
    assert!(!conn.set_closed_signal(late_tx));
}
