//! Remote server list fetch pipeline
//!
//! download -> parse manifest -> verify signature -> decode entries -> store.
//! Each step runs only if every earlier step succeeded.

use std::sync::Arc;
use std::time::Duration;

use sidestep_connection::{ConnRegistry, DeviceBinder, DialConfig, TcpDialer};
use thiserror::Error;
use tracing::info;

use crate::http::{http_get, FetchError};
use crate::manifest::{validate_remote_server_list, RemoteServerList, ValidationError};
use crate::server_entry::{ServerEntryDecoder, ServerEntryError};
use crate::store::{ServerEntryStore, StoreError};

/// Overall bound on downloading the remote server list
pub const FETCH_REMOTE_SERVER_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote server list errors
#[derive(Debug, Error)]
pub enum RemoteListError {
    #[error("Failed to fetch remote server list: {0}")]
    Fetch(#[from] FetchError),

    #[error("Malformed remote server list: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Remote server list failed validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to decode server entries: {0}")]
    Decode(#[from] ServerEntryError),

    #[error("Failed to store server entries: {0}")]
    Store(#[from] StoreError),
}

/// Where to fetch the list from, how to authenticate it, and how to dial
#[derive(Clone)]
pub struct FetchConfig {
    pub remote_server_list_url: String,
    /// Base64 DER (PKIX) RSA public key the list must be signed with
    pub remote_server_list_signature_public_key: String,
    pub upstream_http_proxy_address: Option<String>,
    pub device_binder: Option<Arc<dyn DeviceBinder>>,
    pub device_binder_dns_server: Option<String>,
    pub timeout: Duration,
}

impl FetchConfig {
    pub fn new(url: impl Into<String>, signature_public_key: impl Into<String>) -> Self {
        Self {
            remote_server_list_url: url.into(),
            remote_server_list_signature_public_key: signature_public_key.into(),
            upstream_http_proxy_address: None,
            device_binder: None,
            device_binder_dns_server: None,
            timeout: FETCH_REMOTE_SERVER_LIST_TIMEOUT,
        }
    }

    pub fn with_upstream_http_proxy_address(mut self, address: Option<String>) -> Self {
        self.upstream_http_proxy_address = address;
        self
    }

    pub fn with_device_binder(
        mut self,
        binder: Option<Arc<dyn DeviceBinder>>,
        dns_server: Option<String>,
    ) -> Self {
        self.device_binder = binder;
        self.device_binder_dns_server = dns_server;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for FetchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchConfig")
            .field("remote_server_list_url", &self.remote_server_list_url)
            .field(
                "upstream_http_proxy_address",
                &self.upstream_http_proxy_address,
            )
            .field("device_binder", &self.device_binder.is_some())
            .field("device_binder_dns_server", &self.device_binder_dns_server)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Download, authenticate and store the remote server list.
///
/// `pending_conns` may be used to interrupt the download with
/// [`ConnRegistry::close_all`]. Returns the number of entries stored.
pub async fn fetch_remote_server_list(
    config: &FetchConfig,
    pending_conns: Arc<ConnRegistry>,
    decoder: &dyn ServerEntryDecoder,
    store: &dyn ServerEntryStore,
) -> Result<usize, RemoteListError> {
    info!("fetching remote server list");

    let dial_config = DialConfig::builder(pending_conns)
        .upstream_http_proxy_address(config.upstream_http_proxy_address.clone())
        .device_binder(config.device_binder.clone())
        .device_binder_dns_server(config.device_binder_dns_server.clone())
        .build();
    let dialer = TcpDialer::new(dial_config);

    let body = tokio::time::timeout(
        config.timeout,
        http_get(&dialer, &config.remote_server_list_url),
    )
    .await
    .map_err(|_| FetchError::Timeout(config.timeout))??;

    process_remote_server_list(
        &body,
        &config.remote_server_list_signature_public_key,
        decoder,
        store,
    )
    .await
}

/// Authenticate a downloaded manifest body and store its entries.
///
/// Entries are only decoded and stored once the signature over the payload
/// has verified. Returns the number of entries stored.
pub async fn process_remote_server_list(
    body: &[u8],
    signature_public_key: &str,
    decoder: &dyn ServerEntryDecoder,
    store: &dyn ServerEntryStore,
) -> Result<usize, RemoteListError> {
    let remote_server_list: RemoteServerList = serde_json::from_slice(body)?;

    validate_remote_server_list(signature_public_key, &remote_server_list)?;

    let entries = decoder.decode_server_entry_list(&remote_server_list.data)?;
    let count = entries.len();

    store.store_server_entries(entries, true).await?;

    info!("stored {} server entries from remote server list", count);
    Ok(count)
}
