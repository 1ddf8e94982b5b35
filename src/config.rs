//! YAML configuration for the `sidestep` binary

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sidestep_connection::{ConnRegistry, DialConfig};
use sidestep_remote_list::FetchConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where to fetch the signed server list and the key it is signed with
    pub remote_server_list: RemoteServerListConfig,

    /// HTTP proxy (supporting CONNECT) every dial goes through, as `host:port`
    #[serde(default)]
    pub upstream_http_proxy_address: Option<String>,

    /// DNS server for device-bound requests
    #[serde(default)]
    pub bind_to_device_dns_server: Option<String>,

    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default)]
    pub read_timeout_secs: Option<u64>,

    #[serde(default)]
    pub write_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerListConfig {
    pub url: String,

    /// Base64 DER SubjectPublicKeyInfo of the RSA signing key
    pub signature_public_key: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        if config.remote_server_list.url.is_empty() {
            anyhow::bail!("remote_server_list.url must not be empty");
        }
        Ok(config)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::new(
            self.remote_server_list.url.clone(),
            self.remote_server_list.signature_public_key.clone(),
        )
        .with_upstream_http_proxy_address(self.upstream_http_proxy_address.clone())
        .with_device_binder(None, self.bind_to_device_dns_server.clone())
    }

    /// Dial configuration for relayed connections, joined to `pending_conns`
    pub fn dial_config(&self, pending_conns: Arc<ConnRegistry>) -> Arc<DialConfig> {
        let mut builder = DialConfig::builder(pending_conns)
            .upstream_http_proxy_address(self.upstream_http_proxy_address.clone())
            .device_binder_dns_server(self.bind_to_device_dns_server.clone());

        if let Some(secs) = self.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.read_timeout_secs {
            builder = builder.read_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_timeout_secs {
            builder = builder.write_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }
}
