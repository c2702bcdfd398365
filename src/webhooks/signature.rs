//! HMAC-SHA256 authentication of inbound webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a webhook signature over the raw, unparsed body.
///
/// The header may carry the bare hex digest or a `sha256=` prefixed one.
/// An empty secret disables verification; the caller is expected to warn
/// about that at startup.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Some(signature) = signature else {
        return false;
    };

    let provided = signature.trim();
    let provided = provided.strip_prefix(PREFIX).unwrap_or(provided);
    let expected = compute_signature(body, secret);

    constant_time_eq(&expected, &provided.to_ascii_lowercase())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a_bytes.iter().zip(b_bytes) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"event":"job_status","job_id":"j-1","timestamp":"t"}"#;

    #[test]
    fn signature_verifies_with_and_without_prefix() {
        let sig = compute_signature(BODY, "s3cret");
        assert_eq!(sig.len(), 64);
        assert!(verify_signature(BODY, Some(&sig), "s3cret"));
        assert!(verify_signature(BODY, Some(&format!("sha256={sig}")), "s3cret"));
    }

    #[test]
    fn signature_fails_for_other_body_or_secret() {
        let sig = compute_signature(BODY, "s3cret");
        assert!(!verify_signature(b"{}", Some(&sig), "s3cret"));
        assert!(!verify_signature(BODY, Some(&sig), "other"));
    }

    #[test]
    fn missing_or_truncated_header_fails() {
        let sig = compute_signature(BODY, "s3cret");
        assert!(!verify_signature(BODY, None, "s3cret"));
        assert!(!verify_signature(BODY, Some(&sig[..20]), "s3cret"));
        assert!(!verify_signature(BODY, Some(""), "s3cret"));
    }

    #[test]
    fn empty_secret_is_permissive() {
        assert!(verify_signature(BODY, None, ""));
        assert!(verify_signature(BODY, Some("garbage"), ""));
    }
}
