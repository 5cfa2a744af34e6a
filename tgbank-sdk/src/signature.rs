//! Webhook signature algorithm and verification.
//!
//! The payment gateway signs every webhook body with HMAC-SHA512 keyed by the
//! account secret and sends the lowercase hex digest in a header:
//!
//! ```text
//! x-paystack-signature: {hex(HMAC-SHA512(raw_body, secret))}
//! ```
//!
//! Verification runs over the raw request bytes, before any JSON parsing.

/// Header name carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Errors produced by signature operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("invalid signature encoding")]
    InvalidFormat,
    #[error("invalid signature")]
    Mismatch,
}

impl From<ring::error::Unspecified> for SignatureError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::Mismatch
    }
}

fn key(secret: &[u8]) -> ring::hmac::Key {
    ring::hmac::Key::new(ring::hmac::HMAC_SHA512, secret)
}

/// Sign a raw body and return the hex digest as sent by the gateway.
pub fn sign_body(body: &[u8], secret: &[u8]) -> String {
    hex::encode(ring::hmac::sign(&key(secret), body).as_ref())
}

/// Verify a raw body against the value of the [`SIGNATURE_HEADER`] header.
///
/// The comparison is constant-time; a header that is not valid hex is
/// reported as [`SignatureError::InvalidFormat`].
pub fn verify_body(body: &[u8], header_value: Option<&str>, secret: &[u8]) -> Result<(), SignatureError> {
    let header_value = header_value.ok_or(SignatureError::Missing)?;
    let signature = hex::decode(header_value.trim()).map_err(|_| SignatureError::InvalidFormat)?;
    ring::hmac::verify(&key(secret), body, &signature)?;
    Ok(())
}
