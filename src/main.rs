//! Sidestep CLI
//!
//! Fetches the signed remote server list and relays local connections
//! through the configured upstream proxy.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sidestep_connection::{ConnRegistry, DirectConn, TcpDialer};
use sidestep_proxy::relay;
use sidestep_remote_list::{
    fetch_remote_server_list, InMemoryServerEntryStore, ServerEntryListDecoder,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Sidestep - fetch signed server lists and relay through HTTP proxies
#[derive(Parser, Debug)]
#[command(name = "sidestep")]
#[command(about = "Sidestep - fetch signed server lists and relay through HTTP proxies")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "SIDESTEP_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download, verify and store the remote server list
    #[command(long_about = r#"
Download the remote server list, verify its RSA signature against the
configured public key, and decode the server entries it carries.

EXAMPLES:
  sidestep fetch --config sidestep.yml

  # Through an HTTP proxy set in the config, with debug logging
  sidestep --log-level debug fetch --config sidestep.yml
    "#)]
    Fetch {
        /// Path to the YAML config file
        #[arg(long, env = "SIDESTEP_CONFIG")]
        config: PathBuf,
    },

    /// Accept local connections and relay each one to a target
    #[command(long_about = r#"
Listen on a local address and relay every accepted connection to the
target, dialed through the upstream HTTP proxy when one is configured.

EXAMPLES:
  sidestep relay --config sidestep.yml \
    --listen 127.0.0.1:5433 \
    --target db.internal:5432
    "#)]
    Relay {
        /// Path to the YAML config file
        #[arg(long, env = "SIDESTEP_CONFIG")]
        config: PathBuf,

        /// Local address to listen on (e.g., 127.0.0.1:5433)
        #[arg(long, env = "SIDESTEP_LISTEN")]
        listen: String,

        /// Target to relay to, as host:port
        #[arg(long, env = "SIDESTEP_TARGET")]
        target: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_fetch(config: Config) -> Result<()> {
    let pending_conns = Arc::new(ConnRegistry::new());
    let store = InMemoryServerEntryStore::new();
    let fetch_config = config.fetch_config();

    let fetch = fetch_remote_server_list(
        &fetch_config,
        pending_conns.clone(),
        &ServerEntryListDecoder,
        &store,
    );
    tokio::pin!(fetch);

    let finished = tokio::select! {
        result = &mut fetch => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Received Ctrl+C, interrupting fetch...");
            pending_conns.close_all();
            fetch.await
        }
    };

    let count = result.context("Failed to fetch remote server list")?;
    info!("Fetched {} server entries", count);
    for entry in store.entries() {
        info!(
            "  {} region={} capabilities={}",
            entry.ip_address,
            entry.region,
            entry.capabilities.join(",")
        );
    }
    Ok(())
}

async fn run_relay(config: Config, listen: String, target: String) -> Result<()> {
    let pending_conns = Arc::new(ConnRegistry::new());
    let established_conns = Arc::new(ConnRegistry::new());
    let dialer = TcpDialer::new(config.dial_config(pending_conns.clone()));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Listening on {}, relaying to {}", listen, target);
    if let Some(proxy) = &config.upstream_http_proxy_address {
        info!("Upstream HTTP proxy: {}", proxy);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        tokio::spawn(relay_connection(
                            stream,
                            dialer.clone(),
                            target.clone(),
                            established_conns.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    pending_conns.close_all();
    established_conns.close_all();

    info!("Sidestep stopped");
    Ok(())
}

async fn relay_connection(
    stream: TcpStream,
    dialer: TcpDialer,
    target: String,
    established_conns: Arc<ConnRegistry>,
) {
    let remote = match dialer.dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to dial {}: {}", target, e);
            return;
        }
    };
    let local = DirectConn::from_stream(stream);

    let local_handle = local.close_handle();
    let remote_handle = remote.close_handle();
    if !established_conns.add(&local_handle) || !established_conns.add(&remote_handle) {
        debug!("Shutting down, dropping connection to {}", target);
        established_conns.remove(&local_handle);
        return;
    }

    relay(local, remote).await;

    established_conns.remove(&local_handle);
    established_conns.remove(&remote_handle);
    debug!("Relay to {} finished", target);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Fetch { config } => {
            let config = Config::load(&config)?;
            run_fetch(config).await
        }
        Commands::Relay {
            config,
            listen,
            target,
        } => {
            let config = Config::load(&config)?;
            run_relay(config, listen, target).await
        }
    }
}
