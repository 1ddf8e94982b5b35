//! Remote server list manifest and its signature check

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::{spki, DecodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Signed manifest carrying an encoded server entry list.
///
/// It may be served from any source, so `data` is only trusted once
/// [`validate_remote_server_list`] succeeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerList {
    /// Encoded server entry list; its UTF-8 bytes are what is signed
    pub data: String,
    /// Digest identifying the signing key. Carried, not cross-checked.
    pub signing_public_key_digest: String,
    /// Base64 RSA PKCS#1 v1.5 signature over SHA-256(`data`)
    pub signature: String,
}

/// Manifest validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid signature public key encoding: {0}")]
    PublicKeyEncoding(#[source] base64::DecodeError),

    #[error("Invalid signature public key: {0}")]
    PublicKey(String),

    #[error("Unexpected signature public key type")]
    UnexpectedKeyType,

    #[error("Invalid signature encoding: {0}")]
    SignatureEncoding(#[source] base64::DecodeError),

    #[error("Signature verification failed: {0}")]
    Verification(#[source] rsa::Error),
}

/// Parse a base64 DER SubjectPublicKeyInfo that must hold an RSA key.
fn parse_rsa_public_key(encoded: &str) -> Result<RsaPublicKey, ValidationError> {
    let der = STANDARD
        .decode(encoded)
        .map_err(ValidationError::PublicKeyEncoding)?;

    RsaPublicKey::from_public_key_der(&der).map_err(|e| match e {
        // Well-formed key info for another algorithm
        spki::Error::OidUnknown { .. } => ValidationError::UnexpectedKeyType,
        other => ValidationError::PublicKey(other.to_string()),
    })
}

/// Verify `list.signature` over `list.data` with the pinned public key.
///
/// `public_key` is the base64 DER (PKIX) encoding of an RSA public key. The
/// signature is RSA PKCS#1 v1.5 over the SHA-256 digest of the raw `data`
/// bytes, not of the whole JSON document.
pub fn validate_remote_server_list(
    public_key: &str,
    list: &RemoteServerList,
) -> Result<(), ValidationError> {
    let rsa_public_key = parse_rsa_public_key(public_key)?;

    let signature = STANDARD
        .decode(&list.signature)
        .map_err(ValidationError::SignatureEncoding)?;

    // TODO: detect lists signed with a different key by matching
    // signing_public_key_digest against a digest of rsa_public_key once the
    // digest encoding is pinned down by the list publisher
    let digest = Sha256::digest(list.data.as_bytes());

    rsa_public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(ValidationError::Verification)
}
