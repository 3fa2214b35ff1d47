//! HMAC-SHA256 signing of delivery bodies, and the matching receiver checks.
//!
//! The signed message is `"{timestamp}.{body}"`, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8], timestamp: &str, body: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Compute the hex signature sent with a delivery.
pub fn sign_payload(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, body).finalize().into_bytes())
}

/// Constant-time check of a received hex signature.
pub fn verify_signature(secret: &[u8], timestamp: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac_for(secret, timestamp, body).verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pick the signature and timestamp out of a header list, case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            parsed.timestamp = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not a unix time")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = parsed.timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, &timestamp_str, body, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
