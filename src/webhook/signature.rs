//! HMAC-SHA256 delivery signatures.
//!
//! The signature covers the canonical raw body exactly as received, no
//! whitespace normalization. Verification goes through `Mac::verify_slice`,
//! which compares in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Sign a raw body, producing the `sha256=<hex>` header value.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(PREFIX.len() + digest.len() * 2);
    out.push_str(PREFIX);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Verify a provided `sha256=<hex>` signature against the raw body.
pub fn verify(secret: &str, body: &[u8], provided: &str) -> bool {
    let Some(hex) = provided.strip_prefix(PREFIX) else {
        return false;
    };
    let Some(expected) = decode_hex(hex) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let body = br#"{"action":"opened","issue":{"number":7}}"#;
        let signature = sign("secret", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify("secret", body, &signature));
    }

    #[test]
    fn test_tampered_body_fails() {
        let signature = sign("secret", b"original");
        assert!(!verify("secret", b"tampered", &signature));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let signature = sign("secret", b"body");
        assert!(!verify("other", b"body", &signature));
    }

    #[test]
    fn test_signature_covers_exact_bytes() {
        // Whitespace changes the canonical body and must fail verification
        let signature = sign("secret", br#"{"a":1}"#);
        assert!(!verify("secret", br#"{"a": 1}"#, &signature));
    }

    #[test]
    fn test_malformed_signatures_fail_closed() {
        assert!(!verify("secret", b"body", ""));
        assert!(!verify("secret", b"body", "sha1=abcd"));
        assert!(!verify("secret", b"body", "sha256=nothex"));
        assert!(!verify("secret", b"body", "sha256=abc"));
    }
}
