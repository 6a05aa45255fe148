//! Identifier generation and webhook signing helpers

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const PAYMENT_ID_PREFIX: &str = "pay";
pub const REFUND_ID_PREFIX: &str = "rfnd";
pub const WEBHOOK_SECRET_PREFIX: &str = "whsec_";

/// `<prefix>_` followed by 16 lowercase hex characters
pub fn generate_id(prefix: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &simple[..16])
}

/// `whsec_` followed by 24 hex characters from 12 random bytes
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}{}", WEBHOOK_SECRET_PREFIX, hex::encode(bytes))
}

/// Hex HMAC-SHA256 of `body` keyed with `secret`. An empty secret is a valid key.
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, including zero
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a received `X-Webhook-Signature` against the exact body bytes.
/// The tag comparison is constant time.
pub fn verify_signature(body: &[u8], secret: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time comparison for stored credentials
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// First `max` characters of `s`, never splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix_and_16_hex_chars() {
        let id = generate_id(PAYMENT_ID_PREFIX);
        assert!(id.starts_with("pay_"));
        let suffix = &id[4..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert!(generate_id(REFUND_ID_PREFIX).starts_with("rfnd_"));
        assert_ne!(generate_id("pay"), generate_id("pay"));
    }

    #[test]
    fn webhook_secret_format() {
        let secret = generate_webhook_secret();
        assert!(secret.starts_with("whsec_"));
        assert_eq!(secret.len(), "whsec_".len() + 24);
    }

    #[test]
    fn signature_matches_only_with_correct_secret() {
        let body = br#"{"event":"payment.success","payload":{"payment":{"id":"pay_1"}}}"#;
        let signature = sign_payload(body, "whsec_test_abc123");

        assert_eq!(signature.len(), 64);
        assert!(verify_signature(body, "whsec_test_abc123", &signature));
        assert!(!verify_signature(body, "whsec_wrong", &signature));
        assert!(!verify_signature(b"{}", "whsec_test_abc123", &signature));
    }

    #[test]
    fn malformed_or_truncated_signature_is_rejected() {
        let body = b"{}";
        let signature = sign_payload(body, "whsec_test_abc123");

        assert!(!verify_signature(body, "whsec_test_abc123", "not-hex"));
        assert!(!verify_signature(body, "whsec_test_abc123", &signature[..32]));
        assert!(!verify_signature(body, "whsec_test_abc123", ""));
        assert!(verify_signature(
            body,
            "whsec_test_abc123",
            &format!(" {}\n", signature)
        ));
    }

    #[test]
    fn empty_secret_still_signs() {
        let signature = sign_payload(b"{}", "");
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(b"{}", "", &signature));
    }

    #[test]
    fn known_hmac_vector() {
        // RFC 4231 test case 2
        let signature = sign_payload(b"what do ya want for nothing?", "Jefe");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        let long = "x".repeat(1500);
        assert_eq!(truncate_chars(&long, 1000).len(), 1000);
    }
}
