//! Delivery signature verification.
//!
//! The sender signs `"{id}.{timestamp}.{body}"` with HMAC-SHA256 under the
//! shared secret and sends the hex digest in `delivery-*` headers.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Maximum allowed clock skew for timestamps in the future.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

const HEADER_PREFIX: &str = "delivery";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),
    #[error("Invalid timestamp")]
    InvalidTimestamp,
    #[error("Timestamp outside tolerance")]
    TimestampOutOfRange,
    #[error("Signature mismatch")]
    Mismatch,
    #[error("Unusable signing key")]
    InvalidKey,
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(format!("{}-{}", HEADER_PREFIX, name))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(name))
}

fn mac(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> Result<Hmac<Sha256>, SignatureError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Hex signature for a delivery.
pub fn compute_signature(
    secret: &str,
    id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    Ok(hex::encode(mac(secret, id, timestamp, body)?.finalize().into_bytes()))
}

/// Check the delivery headers against `body`.
///
/// `delivery-signature` may carry several space-separated candidates, each
/// optionally prefixed with a version tag such as `v1,`.
pub fn verify_signature(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let id = header(headers, "id")?;
    let timestamp = header(headers, "timestamp")?;
    let signatures = header(headers, "signature")?;

    let sent_at: i64 = timestamp.parse().map_err(|_| SignatureError::InvalidTimestamp)?;
    let age = now - sent_at;
    if age > tolerance_secs || age < -MAX_CLOCK_SKEW_SECS {
        return Err(SignatureError::TimestampOutOfRange);
    }

    let expected = mac(secret, id, timestamp, body)?.finalize().into_bytes();

    let matched = signatures
        .split_whitespace()
        .map(|candidate| candidate.split_once(',').map_or(candidate, |(_, sig)| sig))
        .filter_map(|candidate| hex::decode(candidate).ok())
        .any(|candidate| candidate.len() == expected.len() && bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
