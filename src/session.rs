//! Encrypted session cookie state.
//!
//! Browsers carry exactly one credential: the session cookie. Its payload is
//! a small JSON state (`handle`, `csrf`, optional return URL and login
//! state) encrypted with AES-256-GCM under the server-held session key. The
//! wire form is base64url(nonce ‖ ciphertext), nonce 12 bytes.
//!
//! Decryption failures are indistinguishable from an absent cookie by
//! design: a tampered or stale cookie simply makes the request anonymous,
//! it never produces an error response.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Session state carried in the encrypted cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    /// Serialized handle of the session token, when logged in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// CSRF token required on mutating API requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf: Option<String>,
    /// Where to send the user after login completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    /// Opaque login-flow state (provider round-trip protection).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_state: Option<String>,
}

impl State {
    /// Whether the given CSRF header value matches the stored token.
    ///
    /// Constant-time; absent values never match.
    #[must_use]
    pub fn csrf_matches(&self, provided: &str) -> bool {
        match &self.csrf {
            Some(csrf) => csrf.as_bytes().ct_eq(provided.as_bytes()).into(),
            None => false,
        }
    }
}

/// Generate a random 128-bit CSRF token.
#[must_use]
pub fn generate_csrf() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Encrypts and decrypts session cookies, and formats the `Set-Cookie`
/// header.
pub struct SessionManager {
    cipher: Aes256Gcm,
    cookie_name: String,
    secure: bool,
}

impl SessionManager {
    /// Create from the 32-byte session key and cookie settings.
    #[must_use]
    pub fn new(key: &[u8; 32], cookie_name: impl Into<String>, secure: bool) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            cookie_name: cookie_name.into(),
            secure,
        }
    }

    /// The configured cookie name.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Encrypt session state into a cookie value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if serialization or encryption fails.
    pub fn seal(&self, state: &State) -> Result<String> {
        let plaintext = serde_json::to_vec(state)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| Error::Internal(format!("Cookie encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            combined,
        ))
    }

    /// Decrypt a cookie value back into session state.
    ///
    /// Returns `None` for anything that does not decrypt cleanly — wrong
    /// key, truncated value, bit flips, or malformed JSON.
    #[must_use]
    pub fn open(&self, cookie_value: &str) -> Option<State> {
        let combined = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            cookie_value,
        )
        .ok()?;
        if combined.len() <= NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    /// Extract and decrypt our cookie from a `Cookie` request header value.
    #[must_use]
    pub fn state_from_cookie_header(&self, header: &str) -> Option<State> {
        let value = header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == self.cookie_name).then_some(value)
        })?;
        self.open(value)
    }

    /// Build a `Set-Cookie` header value carrying the sealed state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if encryption fails.
    pub fn set_cookie(&self, state: &State) -> Result<String> {
        let sealed = self.seal(state)?;
        Ok(self.cookie_attributes(&sealed, None))
    }

    /// Build a `Set-Cookie` header value that expires the cookie.
    #[must_use]
    pub fn clear_cookie(&self) -> String {
        self.cookie_attributes("", Some(0))
    }

    fn cookie_attributes(&self, value: &str, max_age: Option<u64>) -> String {
        let mut cookie = format!(
            "{}={value}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Some(age) = max_age {
            cookie.push_str(&format!("; Max-Age={age}"));
        }
        cookie
    }
}
