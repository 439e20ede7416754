//! Shared-key request authentication.
//!
//! Callers sign the raw request body with HMAC-SHA256 and send the hex digest
//! in the `X-Covenant-HMAC` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_COVENANT_HMAC: &str = "X-Covenant-HMAC";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing HMAC header")]
    MissingHmac,

    #[error("invalid HMAC")]
    InvalidHmac,

    #[error("unusable HMAC key")]
    InvalidKey,
}

fn keyed_mac(key: &str) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| AuthError::InvalidKey)
}

/// Hex HMAC-SHA256 of `body` under `key`.
pub fn generate_hmac(key: &str, body: &[u8]) -> Result<String, AuthError> {
    let mut mac = keyed_mac(key)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `provided` (hex) against the HMAC of `body` in constant time.
pub fn validate_hmac(key: &str, body: &[u8], provided: Option<&str>) -> Result<(), AuthError> {
    let provided = provided
        .filter(|h| !h.is_empty())
        .ok_or(AuthError::MissingHmac)?;
    let provided = hex::decode(provided).map_err(|_| AuthError::InvalidHmac)?;

    let mut mac = keyed_mac(key)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| AuthError::InvalidHmac)
}
