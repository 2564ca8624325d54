//! Token data model and lifecycle services.
//!
//! A token exists in two forms at once: the signed JWT (what services
//! downstream of the proxy consume) and an opaque handle (what clients
//! actually hold). The stored [`TokenRecord`] binds the two together and is
//! the single source of truth for a token's lifecycle: once the record is
//! gone — revoked or expired — both forms are dead, whatever their own
//! claims say about expiry.

mod cache;
mod service;

pub use cache::TokenCache;
pub use service::{CreateTokenRequest, TokenService};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::handle::Handle;
use crate::jwt::{Claims, Group};

/// The kind of a stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Issued at login, bound to the session cookie.
    Session,
    /// Long-lived, created by the user through the API.
    User,
    /// Machine-to-machine token derived from a session on demand.
    Internal,
    /// Session-scoped child token carrying the user's full scope.
    Notebook,
    /// Issued administratively for in-cluster callers.
    Service,
}

impl TokenType {
    /// Lowercase wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::User => "user",
            Self::Internal => "internal",
            Self::Notebook => "notebook",
            Self::Service => "service",
        }
    }
}

/// Identity delivered by a login provider or extracted from a verified
/// token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Username.
    pub username: String,
    /// Numeric UID.
    pub uid: u64,
    /// Email address, when known.
    pub email: Option<String>,
    /// Group memberships.
    pub groups: Vec<Group>,
}

impl UserInfo {
    /// Extract identity from a verified claim set.
    #[must_use]
    pub fn from_claims(claims: &Claims, config: &Config) -> Self {
        Self {
            username: claims.username(config.username_claim()).to_string(),
            uid: claims.uid(config.uid_claim()).unwrap_or_default(),
            email: claims.email.clone(),
            groups: claims.groups.clone(),
        }
    }
}

/// The persisted form of a token. Keyed by `jti`; also indexed by username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Unique token ID; equals the handle's key part.
    pub jti: String,
    /// Token kind.
    pub token_type: TokenType,
    /// `jti` of the parent session, for derived tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_jti: Option<String>,
    /// Owning username.
    pub username: String,
    /// Owning numeric UID.
    pub uid: u64,
    /// User-chosen name, for user tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    /// Consuming service, for internal tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Creation time, epoch seconds.
    pub created_at: i64,
    /// Expiry time, epoch seconds.
    pub expires_at: i64,
    /// The signed JWT.
    pub token: String,
    /// Hex SHA-256 digest of the handle secret.
    pub secret_hash: String,
}

impl TokenRecord {
    /// Whether the record has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Remaining lifetime in whole seconds, if any.
    #[must_use]
    pub fn remaining(&self, now: i64) -> Option<std::time::Duration> {
        u64::try_from(self.expires_at - now)
            .ok()
            .filter(|s| *s > 0)
            .map(std::time::Duration::from_secs)
    }
}

/// A freshly issued token: the handle to give the caller plus the stored
/// record.
#[derive(Debug, Clone)]
pub struct Issued {
    /// The opaque handle (the only copy of the secret).
    pub handle: Handle,
    /// The stored record, including the signed JWT.
    pub record: TokenRecord,
}

impl Issued {
    /// Serialize the handle with the configured prefix.
    #[must_use]
    pub fn encoded_handle(&self, prefix: &str) -> String {
        self.handle.encode(prefix)
    }
}

/// A resolved token: verified claims plus the encoded JWT they came from.
#[derive(Debug, Clone)]
pub struct TokenData {
    /// Verified (or store-backed) claim set.
    pub claims: Claims,
    /// The signed JWT in compact form.
    pub encoded: String,
}

impl TokenData {
    /// Seconds until expiry relative to `now`.
    #[must_use]
    pub fn remaining(&self, now: i64) -> i64 {
        self.claims.exp - now
    }
}
