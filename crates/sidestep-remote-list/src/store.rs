//! Server entry storage
//!
//! Storage is pluggable; the in-memory store is the default and keeps
//! nothing across restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::server_entry::ServerEntry;

/// Errors that can occur in storage implementations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Trait for persisting server entries
#[async_trait]
pub trait ServerEntryStore: Send + Sync {
    /// Store `entries`. With `replace_if_exists` an entry for an already
    /// known server overwrites the stored one; otherwise the stored one wins.
    async fn store_server_entries(
        &self,
        entries: Vec<ServerEntry>,
        replace_if_exists: bool,
    ) -> Result<(), StoreError>;
}

/// In-memory server entry store keyed by IP address
#[derive(Clone, Default)]
pub struct InMemoryServerEntryStore {
    entries: Arc<Mutex<HashMap<String, ServerEntry>>>,
}

impl InMemoryServerEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip_address: &str) -> Option<ServerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip_address)
            .cloned()
    }

    pub fn entries(&self) -> Vec<ServerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServerEntryStore for InMemoryServerEntryStore {
    async fn store_server_entries(
        &self,
        entries: Vec<ServerEntry>,
        replace_if_exists: bool,
    ) -> Result<(), StoreError> {
        let mut stored = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut inserted = 0;
        for entry in entries {
            if !replace_if_exists && stored.contains_key(&entry.ip_address) {
                continue;
            }
            stored.insert(entry.ip_address.clone(), entry);
            inserted += 1;
        }
        debug!("Stored {} server entries ({} total)", inserted, stored.len());
        Ok(())
    }
}
