//! Opaque token handles.
//!
//! A handle is the only credential a client ever holds for a stored token:
//! `{prefix}-{key}.{secret}` where `key` and `secret` are each 22 characters
//! of URL-safe base64 (16 random bytes, no padding). The `key` doubles as the
//! stored token's `jti`; the `secret` is never persisted — only its SHA-256
//! digest is stored, and lookups compare digests in constant time.
//!
//! The prefix makes handles greppable and detectable by secret scanners.

use rand::RngExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the base64url encoding of 16 bytes, without padding.
const PART_LEN: usize = 22;

/// An opaque handle referencing a stored token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    /// Storage key; equal to the token's `jti`.
    pub key: String,
    /// Proof of possession; never stored in cleartext.
    pub secret: String,
}

impl Handle {
    /// Generate a fresh handle with 128 bits of entropy in each part.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: random_part(),
            secret: random_part(),
        }
    }

    /// Serialize as `{prefix}-{key}.{secret}`.
    #[must_use]
    pub fn encode(&self, prefix: &str) -> String {
        format!("{prefix}-{}.{}", self.key, self.secret)
    }

    /// Parse a serialized handle.
    ///
    /// Strict: the prefix must match exactly and both parts must be
    /// well-formed 22-character base64url values. Returns `None` otherwise —
    /// a string that fails to parse is simply not a handle.
    #[must_use]
    pub fn decode(prefix: &str, s: &str) -> Option<Self> {
        let rest = s.strip_prefix(prefix)?.strip_prefix('-')?;
        let (key, secret) = rest.split_once('.')?;
        if !is_valid_part(key) || !is_valid_part(secret) {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Hex-encoded SHA-256 digest of the secret, for storage.
    #[must_use]
    pub fn secret_hash(&self) -> String {
        hex::encode(Sha256::digest(self.secret.as_bytes()))
    }

    /// Compare this handle's secret against a stored digest in constant time.
    #[must_use]
    pub fn secret_matches(&self, stored_hash: &str) -> bool {
        self.secret_hash()
            .as_bytes()
            .ct_eq(stored_hash.as_bytes())
            .into()
    }
}

/// 22 characters of URL-safe base64 from 16 random bytes.
fn random_part() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

fn is_valid_part(s: &str) -> bool {
    s.len() == PART_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
