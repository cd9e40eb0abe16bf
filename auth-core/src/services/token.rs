//! Opaque session token generation and hashing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of random bytes behind every token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Bearer token handed to the client after login.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Draw a fresh token from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap a token presented by a client.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Storage key for this token in both stores.
    pub fn hash(&self) -> String {
        hash_token(&self.0)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// SHA-256 of a raw token, hex-encoded.
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short prefix of a token hash, safe to put in logs.
pub fn fingerprint(token_hash: &str) -> &str {
    let end = token_hash.len().min(12);
    &token_hash[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn token_is_url_safe() {
        let token = SessionToken::generate();
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 32 bytes -> 43 base64url chars.
        assert_eq!(token.as_str().len(), 43);
    }

    #[test]
    fn tokens_do_not_repeat() {
        let tokens: HashSet<String> = (0..1000)
            .map(|_| SessionToken::generate().into_string())
            .collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn hash_is_deterministic_and_hex() {
        let token = SessionToken::from_raw("some-token");
        assert_eq!(token.hash(), hash_token("some-token"));
        assert_eq!(token.hash().len(), 64);
        assert_ne!(hash_token("token-a"), hash_token("token-b"));
    }

    #[test]
    fn debug_never_prints_the_token() {
        let token = SessionToken::generate();
        assert!(!format!("{:?}", token).contains(token.as_str()));
    }

    #[test]
    fn fingerprint_is_a_prefix() {
        let h = hash_token("x");
        assert_eq!(fingerprint(&h), &h[..12]);
        assert_eq!(fingerprint("abc"), "abc");
    }
}
