//! Challenge/response primitives for the shared-passphrase handshake.
//!
//! The accepting side sends a random decimal challenge. The peer proves it
//! knows the passphrase by returning the hex SHA-256 digest of
//! `phrase || challenge`. The passphrase itself never crosses the wire.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generates a fresh challenge string.
#[must_use]
pub fn generate_challenge() -> String {
    rand::random::<u32>().to_string()
}

/// Computes the response digest for `challenge` under `phrase`.
#[must_use]
pub fn digest(phrase: &str, challenge: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phrase.as_bytes());
    hasher.update(challenge.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks a peer's response in constant time.
#[must_use]
pub fn verify(phrase: &str, challenge: &str, response: &str) -> bool {
    let expected = digest(phrase, challenge);
    expected.as_bytes().ct_eq(response.trim().as_bytes()).into()
}

/// Compares a supplied passphrase with the configured one in constant time.
#[must_use]
pub fn phrase_matches(phrase: &str, candidate: &str) -> bool {
    phrase.as_bytes().ct_eq(candidate.as_bytes()).into()
}

/// Decodes a hex-encoded launch password (`p=`).
///
/// Returns `None` when the input is not valid hex or not UTF-8.
#[must_use]
pub fn decode_password(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Encodes a password for the `p=` launch key.
#[must_use]
pub fn encode_password(password: &str) -> String {
    hex::encode(password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_phrase_verifies() {
        let challenge = generate_challenge();
        let response = digest("behappy", &challenge);
        assert!(verify("behappy", &challenge, &response));
        assert_eq!(response.len(), 64);
    }

    #[test]
    fn wrong_phrase_is_rejected() {
        let challenge = "12345";
        let response = digest("wrong", challenge);
        assert!(!verify("behappy", challenge, &response));
        assert!(!verify("behappy", challenge, ""));
    }

    #[test]
    fn phrase_comparison() {
        assert!(phrase_matches("behappy", "behappy"));
        assert!(!phrase_matches("behappy", "behapp"));
        assert!(!phrase_matches("behappy", "BEHAPPY"));
        assert!(!phrase_matches("behappy", ""));
    }

    #[test]
    fn digest_depends_on_challenge() {
        assert_ne!(digest("behappy", "1"), digest("behappy", "2"));
    }

    #[test]
    fn password_hex_round_trip() {
        let encoded = encode_password("s3cret pw");
        assert_eq!(decode_password(&encoded).as_deref(), Some("s3cret pw"));
        assert_eq!(decode_password("zz"), None);
    }
}
