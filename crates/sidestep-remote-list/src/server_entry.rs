//! Server entry decoding
//!
//! A server entry list is newline separated. Each line is the hex encoding of
//! `<ip> <web port> <web secret> <web certificate> <json>`; only the JSON
//! field is authoritative, the first four are a legacy prefix.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Number of space separated fields in a decoded server entry
const ENCODED_FIELD_COUNT: usize = 5;

/// A candidate server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEntry {
    pub ip_address: String,
    pub web_server_port: String,
    pub web_server_secret: String,
    pub web_server_certificate: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: String,
    pub ssh_host_key: String,
    pub ssh_obfuscated_port: u16,
    pub ssh_obfuscated_key: String,
    pub capabilities: Vec<String>,
    pub region: String,
    pub meek_server_port: u16,
    pub meek_cookie_encryption_public_key: String,
    pub meek_obfuscated_key: String,
    pub meek_fronting_host: String,
    pub meek_fronting_domain: String,
    pub meek_fronting_addresses: Vec<String>,
}

impl ServerEntry {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Server entry errors
#[derive(Debug, Error)]
pub enum ServerEntryError {
    #[error("Invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid encoded server entry: expected 5 space separated fields")]
    MissingFields,

    #[error("Invalid server entry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server entry has invalid IP address '{0}'")]
    InvalidIpAddress(String),
}

/// Decode one hex encoded server entry.
pub fn decode_server_entry(encoded: &str) -> Result<ServerEntry, ServerEntryError> {
    let decoded = hex::decode(encoded)?;
    let fields: Vec<&[u8]> = decoded.splitn(ENCODED_FIELD_COUNT, |b| *b == b' ').collect();
    if fields.len() != ENCODED_FIELD_COUNT {
        return Err(ServerEntryError::MissingFields);
    }
    Ok(serde_json::from_slice(fields[ENCODED_FIELD_COUNT - 1])?)
}

/// Encode a server entry in the list line format.
pub fn encode_server_entry(entry: &ServerEntry) -> Result<String, ServerEntryError> {
    let json = serde_json::to_string(entry)?;
    let line = format!(
        "{} {} {} {} {}",
        entry.ip_address,
        entry.web_server_port,
        entry.web_server_secret,
        entry.web_server_certificate,
        json
    );
    Ok(hex::encode(line))
}

pub fn validate_server_entry(entry: &ServerEntry) -> Result<(), ServerEntryError> {
    if entry.ip_address.parse::<IpAddr>().is_err() {
        return Err(ServerEntryError::InvalidIpAddress(entry.ip_address.clone()));
    }
    Ok(())
}

/// Decode every line of a server entry list.
///
/// A line that cannot be decoded fails the whole list; a decoded entry that
/// fails validation is skipped.
pub fn decode_and_validate_server_entry_list(
    encoded_list: &str,
) -> Result<Vec<ServerEntry>, ServerEntryError> {
    let mut entries = Vec::new();
    for line in encoded_list.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry = decode_server_entry(line)?;
        if let Err(e) = validate_server_entry(&entry) {
            warn!("Skipping server entry: {}", e);
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Turns a verified payload into server entries.
pub trait ServerEntryDecoder: Send + Sync {
    fn decode_server_entry_list(&self, data: &str) -> Result<Vec<ServerEntry>, ServerEntryError>;
}

/// Decoder for the hex line format
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerEntryListDecoder;

impl ServerEntryDecoder for ServerEntryListDecoder {
    fn decode_server_entry_list(&self, data: &str) -> Result<Vec<ServerEntry>, ServerEntryError> {
        decode_and_validate_server_entry_list(data)
    }
}
