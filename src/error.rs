//! Error types for the gateway.

use thiserror::Error;

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
///
/// The variants mirror the HTTP mapping performed at the gateway layer:
/// authentication failures become 401 responses with a `WWW-Authenticate`
/// challenge, authorization failures become 403, validation failures 422,
/// and infrastructure failures 500 (the engine never fails open).
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed query parameters on the decision endpoint
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No credential, or the credential could not be resolved
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The token is structurally invalid or its signature does not verify
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The token's `exp` claim has passed
    #[error("Token has expired")]
    Expired,

    /// The token's `iss` claim is not in the trusted issuer set
    #[error("Untrusted issuer: {0}")]
    UntrustedIssuer(String),

    /// The token's `aud` claim matches no configured audience
    #[error("Wrong audience: {0}")]
    WrongAudience(String),

    /// Authenticated, but the capability checks failed
    #[error("Denied: {0}")]
    Denied(String),

    /// Admin-only or owner-only operation attempted by someone else
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Request payload failed validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A derived token cannot satisfy the minimum lifetime
    #[error("Insufficient lifetime: parent token expires in {remaining}s, minimum is {minimum}s")]
    InsufficientLifetime {
        /// Seconds until the parent token expires.
        remaining: i64,
        /// Required minimum lifetime in seconds.
        minimum: i64,
    },

    /// The requested resource does not exist (or belongs to someone else)
    #[error("Not found: {0}")]
    NotFound(String),

    /// No signing key with the requested `kid` at the issuer
    #[error("Unknown signing key {kid} for issuer {issuer}")]
    UnknownKey {
        /// Issuer URL that was queried.
        issuer: String,
        /// Key ID that was not found.
        kid: String,
    },

    /// JWKS fetch or provider call failed
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The key-value store is unreachable or returned an error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// RFC 6750 error code for the `WWW-Authenticate` challenge, when the
    /// error maps to a 401.
    #[must_use]
    pub fn challenge_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "invalid_request",
            _ => "invalid_token",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {e}"))
    }
}
