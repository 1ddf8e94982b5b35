//! Signed remote server list distribution
//!
//! Downloads a signed server list manifest from an untrusted source,
//! authenticates it against a pinned RSA public key, and hands the verified
//! server entries to storage. Nothing from the manifest payload is decoded or
//! stored unless its signature verifies.

pub mod fetch;
pub mod http;
pub mod manifest;
pub mod server_entry;
pub mod store;

pub use fetch::{
    fetch_remote_server_list, process_remote_server_list, FetchConfig, RemoteListError,
    FETCH_REMOTE_SERVER_LIST_TIMEOUT,
};
pub use http::{http_get, FetchError};
pub use manifest::{validate_remote_server_list, RemoteServerList, ValidationError};
pub use server_entry::{
    decode_and_validate_server_entry_list, decode_server_entry, encode_server_entry,
    validate_server_entry, ServerEntry, ServerEntryDecoder, ServerEntryError,
    ServerEntryListDecoder,
};
pub use store::{InMemoryServerEntryStore, ServerEntryStore, StoreError};
