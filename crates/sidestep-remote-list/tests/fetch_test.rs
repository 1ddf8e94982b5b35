//! End-to-end remote server list fetches against a loopback HTTP server

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use sidestep_connection::{ConnRegistry, DialError};
use sidestep_remote_list::{
    encode_server_entry, fetch_remote_server_list, FetchConfig, FetchError,
    InMemoryServerEntryStore, RemoteListError, RemoteServerList, ServerEntry,
    ServerEntryListDecoder, ServerEntryStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn signing_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}

fn public_key() -> String {
    let der = RsaPublicKey::from(signing_key())
        .to_public_key_der()
        .unwrap();
    STANDARD.encode(der.as_bytes())
}

fn signed_manifest(ips: &[&str]) -> RemoteServerList {
    let data = ips
        .iter()
        .map(|ip| {
            encode_server_entry(&ServerEntry {
                ip_address: ip.to_string(),
                region: "CA".to_string(),
                ..Default::default()
            })
            .unwrap()
        })
        .collect::<Vec<_>>()
        .join("\n");
    let digest = Sha256::digest(data.as_bytes());
    let signature = signing_key()
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .unwrap();
    RemoteServerList {
        data,
        signing_public_key_digest: String::new(),
        signature: STANDARD.encode(signature),
    }
}

/// Serve one canned HTTP response and hand back the request head
async fn serve_once(status: &'static str, body: Vec<u8>) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/server_list", listener.local_addr().unwrap());
    let (request_tx, request_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let _ = request_tx.send(String::from_utf8_lossy(&head).into_owned());

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        let _ = stream.shutdown().await;
    });

    (url, request_rx)
}

#[tokio::test]
async fn test_fetch_stores_verified_entries() {
    let body = serde_json::to_vec(&signed_manifest(&["192.0.2.1", "192.0.2.2"])).unwrap();
    let (url, request) = serve_once("200 OK", body).await;
    let store = InMemoryServerEntryStore::new();

    let count = fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &store,
    )
    .await
    .unwrap();

    assert_eq!(count, 2);
    assert_eq!(store.get("192.0.2.2").unwrap().region, "CA");

    let request = request.await.unwrap();
    assert!(request.starts_with("GET /server_list HTTP/1.1\r\n"));
    assert!(request.to_ascii_lowercase().contains("host: 127.0.0.1:"));
}

#[tokio::test]
async fn test_fetch_replaces_known_entries() {
    let store = InMemoryServerEntryStore::new();
    store
        .store_server_entries(
            vec![ServerEntry {
                ip_address: "192.0.2.1".to_string(),
                region: "US".to_string(),
                ..Default::default()
            }],
            true,
        )
        .await
        .unwrap();

    let body = serde_json::to_vec(&signed_manifest(&["192.0.2.1"])).unwrap();
    let (url, _request) = serve_once("200 OK", body).await;

    fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &store,
    )
    .await
    .unwrap();

    assert_eq!(store.get("192.0.2.1").unwrap().region, "CA");
}

#[tokio::test]
async fn test_fetch_rejects_tampered_list() {
    let mut manifest = signed_manifest(&["192.0.2.1"]);
    manifest.data = signed_manifest(&["203.0.113.66"]).data;
    let (url, _request) = serve_once("200 OK", serde_json::to_vec(&manifest).unwrap()).await;
    let store = InMemoryServerEntryStore::new();

    let err = fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &store,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RemoteListError::Validation(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_fetch_malformed_body() {
    let (url, _request) = serve_once("200 OK", b"not json".to_vec()).await;
    let store = InMemoryServerEntryStore::new();

    let err = fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &store,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RemoteListError::Format(_)));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_fetch_http_error_status() {
    let (url, _request) = serve_once("404 Not Found", b"gone".to_vec()).await;
    let store = InMemoryServerEntryStore::new();

    let err = fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &store,
    )
    .await
    .unwrap_err();

    match err {
        RemoteListError::Fetch(FetchError::Status(status)) => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected error: {other}"),
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_fetch_interrupted_by_closed_registry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/server_list", listener.local_addr().unwrap());
    let pending_conns = Arc::new(ConnRegistry::new());
    pending_conns.close_all();

    let err = fetch_remote_server_list(
        &FetchConfig::new(url, public_key()),
        pending_conns,
        &ServerEntryListDecoder,
        &InMemoryServerEntryStore::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RemoteListError::Fetch(FetchError::Dial(DialError::Interrupted))
    ));
}

#[tokio::test]
async fn test_fetch_times_out_on_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/server_list", listener.local_addr().unwrap());

    // Accept and then never answer
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let config = FetchConfig::new(url, public_key()).with_timeout(Duration::from_millis(200));
    let err = fetch_remote_server_list(
        &config,
        Arc::new(ConnRegistry::new()),
        &ServerEntryListDecoder,
        &InMemoryServerEntryStore::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        RemoteListError::Fetch(FetchError::Timeout(_))
    ));
}
