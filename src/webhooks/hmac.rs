use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encodes the HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// `true` iff `signature` (with or without a leading `sha256=`) equals the
/// hex HMAC-SHA256 of `body` under `secret`. The comparison itself is
/// constant-time via `Mac::verify_slice`; only the final boolean leaks.
pub fn validate_hmac(secret: &str, body: &[u8], signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);

    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validate_hmac_accepts_matching_signature() {
        let secret = "topsecret";
        let body = b"{\"event\":\"bounce\"}";
        let sig = sign(secret, body);

        assert!(validate_hmac(secret, body, &sig));
        assert!(validate_hmac(secret, body, &format!("sha256={sig}")));
    }

    #[test]
    fn validate_hmac_rejects_wrong_signature() {
        let secret = "topsecret";
        let body = b"{\"event\":\"bounce\"}";
        assert!(!validate_hmac(secret, body, "deadbeef"));
        assert!(!validate_hmac(secret, body, &sign("othersecret", body)));
    }

    #[test]
    fn validate_hmac_rejects_malformed_hex() {
        assert!(!validate_hmac("secret", b"body", "not-hex!!"));
    }
}
