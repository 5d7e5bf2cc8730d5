//! HMAC-SHA256 webhook signatures.
//!
//! The signed message is `"{timestamp}.{body}"`, so a captured body cannot
//! be replayed under a different timestamp. The signature is hex-encoded.

use ring::hmac;

fn message(timestamp: i64, body: &str) -> String {
    format!("{timestamp}.{body}")
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"` under `secret`.
#[must_use]
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, message(timestamp, body).as_bytes());
    hex::encode(tag.as_ref())
}

/// Check a received signature in constant time. For webhook receivers.
#[must_use]
pub fn verify_signature(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, message(timestamp, body).as_bytes(), &signature).is_ok()
}
