use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::types::EventEnvelope;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const ID_HEADER: &str = "X-Webhook-Id";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Serialize an envelope exactly as it is sent on the wire.
///
/// Signing and verification both go through this function.
pub fn canonical_payload(envelope: &EventEnvelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Compute the hex-encoded HMAC-SHA256 of `payload`.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over raw payload bytes in constant time.
///
/// Malformed hex or a wrong-length digest simply fails.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = keyed_mac(secret);
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Sign an envelope with an endpoint secret.
pub fn sign(envelope: &EventEnvelope, secret: &str) -> Result<String, serde_json::Error> {
    let payload = canonical_payload(envelope)?;
    Ok(compute_signature(secret.as_bytes(), &payload))
}

/// Check that `signature_hex` was produced by [`sign`] with `secret`.
pub fn verify(envelope: &EventEnvelope, signature_hex: &str, secret: &str) -> bool {
    match canonical_payload(envelope) {
        Ok(payload) => verify_signature(secret.as_bytes(), &payload, signature_hex),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub webhook_id: Option<String>,
}

/// Pull the signature and webhook id out of a header list.
/// Header names match case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(ID_HEADER) {
            parsed.webhook_id = Some(value.to_string());
        }
    }

    parsed
}

/// Inbound verification failures. All of them mean "not authenticated".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("missing webhook id")]
    MissingWebhookId,

    #[error("invalid webhook endpoint")]
    UnknownEndpoint,

    #[error("invalid webhook signature")]
    InvalidSignature,
}

impl VerificationError {
    /// Every verification failure maps to an authentication failure (HTTP 401).
    pub fn status_code(&self) -> u16 {
        401
    }
}

/// Verify an incoming webhook body against a known secret in one call.
pub fn verify_webhook_request<'a, I>(headers: I, payload: &[u8], secret: &[u8]) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, payload, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
