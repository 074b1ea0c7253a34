//! Webhook body signatures: HMAC-SHA256 over the raw, unparsed request body,
//! carried as `sha256=<hex>` in a provider header and compared in constant
//! time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes the `sha256=<hex>` header value for `body`. Used by the webchat
/// widget side and by tests.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a `sha256=<hex>` signature header against the raw body.
///
/// Returns `false` for a missing header, a malformed prefix, or a digest
/// mismatch; the caller treats all three the same way (reject, log a
/// security event, no retry).
pub fn verify_signature(secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let Some(sig) = header else {
        return false;
    };
    let Some(provided) = sig.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let digest = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(provided.as_bytes(), digest.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_signature() {
        let body = b"{\"entry\":[]}";
        let sig = sign_body("secret", body);
        assert!(verify_signature("secret", Some(&sig), body));
    }

    #[test]
    fn verification_is_deterministic() {
        let body = b"{\"object\":\"page\"}";
        let sig = sign_body("secret", body);
        assert!(verify_signature("secret", Some(&sig), body));
        assert!(verify_signature("secret", Some(&sig), body));
    }

    #[test]
    fn altered_body_fails_with_original_signature() {
        let body = b"{\"text\":\"Hola\"}";
        let sig = sign_body("secret", body);
        assert!(!verify_signature("secret", Some(&sig), b"{\"text\":\"Hola!\"}"));
    }

    #[test]
    fn rejects_missing_header_and_bad_prefix() {
        assert!(!verify_signature("secret", None, b"{}"));
        assert!(!verify_signature("secret", Some("md5=abcd"), b"{}"));
        assert!(!verify_signature("secret", Some("sha256=deadbeef"), b"{}"));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = b"{}";
        let sig = sign_body("secret", body);
        assert!(!verify_signature("other", Some(&sig), body));
    }
}
