//! Payload signing for outbound webhooks.
//!
//! The default scheme signs `"<unix_ts>.<body>"` with HMAC-SHA256 and emits
//! `X-Webhook-Signature: t=<unix_ts>,v1=<hex digest>`. Binding the timestamp
//! into the MAC lets receivers reject replays outside their tolerance window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// A signing strategy for outbound payloads.
pub trait PayloadSigner: Send + Sync {
    /// Header name carrying the signature.
    fn header_name(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    /// Header value for `body` signed with `secret` at `timestamp` (unix seconds).
    fn sign(&self, secret: &str, timestamp: i64, body: &[u8]) -> String;
}

/// `t=<ts>,v1=<hex(HMAC-SHA256(secret, "<ts>.<body>"))>`
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha256Signer;

impl PayloadSigner for HmacSha256Signer {
    fn sign(&self, secret: &str, timestamp: i64, body: &[u8]) -> String {
        let digest = signed_payload_mac(secret, timestamp, body).finalize().into_bytes();
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }
}

fn signed_payload_mac(secret: &str, timestamp: i64, body: &[u8]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Check an `X-Webhook-Signature` header value against `body`.
///
/// Accepts any `v1=` entry in the header (receivers may see several during
/// secret rotation). Comparison is constant-time. Timestamp freshness is the
/// receiver's policy and is not checked here.
pub fn verify(secret: &str, body: &[u8], header_value: &str) -> bool {
    let mut timestamp: Option<i64> = None;
    let mut candidates = Vec::new();

    for part in header_value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };

    candidates.into_iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        signed_payload_mac(secret, timestamp, body)
            .verify_slice(&expected)
            .is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"invoice.paid"}"#;

    #[test]
    fn test_signature_format() {
        let header = HmacSha256Signer.sign(SECRET, 1_700_000_000, BODY);
        let (t, v1) = header.split_once(',').unwrap();
        assert_eq!(t, "t=1700000000");
        let digest = v1.strip_prefix("v1=").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "1.{}")
        let mut mac = HmacSha256::new_from_slice(b"key").unwrap();
        mac.update(b"1.{}");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(HmacSha256Signer.sign("key", 1, b"{}"), format!("t=1,v1={}", expected));
    }

    #[test]
    fn test_verify_roundtrip() {
        let header = HmacSha256Signer.sign(SECRET, 1_700_000_000, BODY);
        assert!(verify(SECRET, BODY, &header));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let header = HmacSha256Signer.sign(SECRET, 1_700_000_000, BODY);

        assert!(!verify("wrong_secret", BODY, &header));
        assert!(!verify(SECRET, br#"{"id":"evt_2"}"#, &header));

        // Replaying the digest under a different timestamp fails
        let replayed = header.replace("t=1700000000", "t=1700009999");
        assert!(!verify(SECRET, BODY, &replayed));
    }

    #[test]
    fn test_verify_rejects_malformed_headers() {
        assert!(!verify(SECRET, BODY, ""));
        assert!(!verify(SECRET, BODY, "v1=abcdef"));
        assert!(!verify(SECRET, BODY, "t=abc,v1=abcdef"));
        assert!(!verify(SECRET, BODY, "t=1700000000,v1=not-hex"));
    }

    #[test]
    fn test_verify_accepts_any_matching_v1() {
        let header = HmacSha256Signer.sign(SECRET, 1_700_000_000, BODY);
        let rotated = format!("{},v1={}", header, "00".repeat(32));
        assert!(verify(SECRET, BODY, &rotated));
    }
}
