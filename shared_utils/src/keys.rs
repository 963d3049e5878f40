//! X25519 key helpers for tunnel configurations.
//!
//! Tunnel configurations carry base64-encoded 32-byte keys. The public key
//! shown to users is derived from the private key by scalar multiplication
//! with the curve base point.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of an X25519 key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors returned when decoding keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Derive the public key for `private_key`.
pub fn derive_public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Decode a base64 key and check its length.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::InvalidBase64(e.to_string()))?;
    <[u8; KEY_LEN]>::try_from(decoded.as_slice()).map_err(|_| KeyError::InvalidLength(decoded.len()))
}

/// Encode a key as base64.
pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
    STANDARD.encode(key)
}

/// Derive the base64 public key for a base64 private key.
pub fn public_key_from_base64(private_key: &str) -> Result<String, KeyError> {
    let private = decode_key(private_key)?;
    Ok(encode_key(&derive_public_key(&private)))
}
