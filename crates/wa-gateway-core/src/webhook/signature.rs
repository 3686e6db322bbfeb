//! Webhook signature verification.
//!
//! The Cloud API signs every webhook body with HMAC-SHA256 keyed by the app
//! secret and sends the result as `X-Hub-Signature-256: sha256=<hex>`.
//! Verification must run over the raw body bytes, before any parsing.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// App secret used to sign webhook deliveries.
///
/// The value is wiped from memory on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the secret value. Do not log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WebhookSecret").field(&"<REDACTED>").finish()
    }
}

fn digest(raw_body: &[u8], secret: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(raw_body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Produce the `sha256=<hex>` signature header value for a body.
pub fn sign(raw_body: &[u8], secret: &WebhookSecret) -> String {
    // HMAC accepts keys of any length, so the digest is always available
    let hex_digest = digest(raw_body, secret.expose_secret().as_bytes())
        .map(hex::encode)
        .unwrap_or_default();
    format!("{}{}", SIGNATURE_PREFIX, hex_digest)
}

/// Check a signature header against the raw body.
///
/// The header must equal the rendered `sha256=<lowercase hex>` value byte
/// for byte, so case changes and surrounding whitespace are rejected too.
/// Returns `false` for an empty secret or any mismatch. The comparison is
/// constant time once the lengths agree.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &WebhookSecret) -> bool {
    if secret.is_empty() {
        warn!("Webhook secret is empty; refusing to verify signature");
        return false;
    }

    if !signature_header.starts_with(SIGNATURE_PREFIX) {
        warn!("Signature header is missing the sha256= prefix");
        return false;
    }

    let expected = sign(raw_body, secret);
    let provided = signature_header.as_bytes();
    if provided.len() != expected.len() {
        warn!("Signature header has the wrong length");
        return false;
    }

    let is_valid: bool = expected.as_bytes().ct_eq(provided).into();
    if !is_valid {
        warn!("Webhook signature does not match body");
    }
    is_valid
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
