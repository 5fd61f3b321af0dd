//! HMAC-SHA256 payload signatures.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the `sha256=<hex>` signature of the body.
pub const SIGNATURE_HEADER: &str = "X-Docflow-Signature";
/// Header carrying the dotted event type.
pub const EVENT_HEADER: &str = "X-Docflow-Event";
/// Header carrying the stable delivery id.
pub const DELIVERY_HEADER: &str = "X-Docflow-Delivery";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Docflow-Attempt";

/// Signs `body` with `secret`, returning `sha256=<hex>`.
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, including empty ones.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a signature produced by [`sign_payload`] in constant time.
///
/// Accepts the signature with or without its `sha256=` prefix.
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
