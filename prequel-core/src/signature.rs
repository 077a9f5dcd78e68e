//! GitHub webhook signature verification.
//!
//! GitHub signs every delivery with HMAC-SHA256 over the exact request body
//! and sends the result as `X-Hub-Signature-256: sha256=<hex>`. Verification
//! must run against the untouched bytes, before any JSON parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header against the raw request body.
///
/// Returns `false` when the header or secret is missing, the header is not of
/// the form `sha256=<hex>`, or the digest does not match. The digest comparison
/// is constant-time.
pub fn verify(raw_body: &[u8], signature_header: Option<&str>, secret: &str) -> bool {
    let Some(signature) = signature_header else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }

    let Some(signature_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(raw_body);

    mac.verify_slice(&signature_bytes).is_ok()
}

/// Compute the `sha256=<hex>` header value for a body.
///
/// Used by tests and local tooling that replays deliveries.
pub fn sign(raw_body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts keys of any length"));
    mac.update(raw_body);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}
