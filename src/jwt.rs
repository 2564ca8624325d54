//! JWT claim model and RS256 codec.
//!
//! Pure functions over claim sets: signing, unverified decoding (used only
//! to read `iss` and `kid` before the verification key is known), and full
//! verification. Only RS256 is accepted; a token signed with any other
//! algorithm is rejected before signature validation is attempted.
//!
//! Verification enforces, in order: algorithm, signature, `exp` (minus
//! leeway), `iat` not in the future (plus leeway), expected issuer, and
//! audience membership. The audience claim may be a single string or an
//! array; both forms are accepted on inbound tokens.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The only JWT algorithm this gateway signs or accepts.
pub const ALGORITHM: Algorithm = Algorithm::RS256;

/// Clock skew tolerance in seconds for `exp`/`iat` checks.
///
/// Deliberately small: these tokens are minted and verified inside one
/// cluster, so only minor drift needs covering, and a large leeway would
/// keep expired tokens usable for its full duration.
pub const LEEWAY: u64 = 5;

/// A group membership entry from the `isMemberOf` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,
    /// Numeric group ID.
    pub id: i64,
}

/// The `aud` claim — a single audience or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// The common single-string form.
    Single(String),
    /// The array form some issuers emit.
    Multiple(Vec<String>),
}

impl Audience {
    /// Whether the claim contains the given audience.
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::Single(a) => a == audience,
            Self::Multiple(list) => list.iter().any(|a| a == audience),
        }
    }

    /// The first (or only) audience value.
    #[must_use]
    pub fn primary(&self) -> &str {
        match self {
            Self::Single(a) => a,
            Self::Multiple(list) => list.first().map_or("", String::as_str),
        }
    }
}

impl From<&str> for Audience {
    fn from(a: &str) -> Self {
        Self::Single(a.to_string())
    }
}

/// Decoded JWT claim set.
///
/// The username and numeric-UID claims use deployment-configurable key names
/// and therefore live in `extra` rather than as typed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer URL.
    pub iss: String,
    /// Audience(s).
    pub aud: Audience,
    /// Subject (the username for tokens we issue).
    pub sub: String,
    /// Issued-at, epoch seconds.
    pub iat: i64,
    /// Expires-at, epoch seconds.
    pub exp: i64,
    /// Unique token ID; also the storage key.
    #[serde(default)]
    pub jti: String,
    /// Email address, when the provider supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Group memberships.
    #[serde(
        rename = "isMemberOf",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub groups: Vec<Group>,
    /// Space-separated scope set.
    #[serde(default)]
    pub scope: String,
    /// Claims with deployment-configured key names (username, uid).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    /// The scope claim as an ordered set of individual scopes.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Whether the scope claim contains the given scope verbatim.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    /// Username from the configured claim key, falling back to `sub`.
    #[must_use]
    pub fn username(&self, claim_key: &str) -> &str {
        self.extra
            .get(claim_key)
            .and_then(|v| v.as_str())
            .unwrap_or(&self.sub)
    }

    /// Numeric UID from the configured claim key.
    #[must_use]
    pub fn uid(&self, claim_key: &str) -> Option<u64> {
        self.extra.get(claim_key).and_then(serde_json::Value::as_u64)
    }

    /// Seconds until expiry relative to `now` (negative if already expired).
    #[must_use]
    pub fn remaining_lifetime(&self, now: i64) -> i64 {
        self.exp - now
    }
}

/// Sign a claim set with RS256.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the key is unusable for signing.
pub fn sign(claims: &Claims, key: &EncodingKey, kid: Option<String>) -> Result<String> {
    let header = Header {
        kid,
        ..Header::new(ALGORITHM)
    };
    jsonwebtoken::encode(&header, claims, key)
        .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
}

/// Decode a JWT without verifying its signature.
///
/// Used only to read `iss` (for issuer lookup) and the header's `kid`
/// (for key selection) before verification.
///
/// # Errors
///
/// Returns [`Error::InvalidToken`] if the token is structurally malformed.
pub fn decode_unverified(encoded: &str) -> Result<(Header, Claims)> {
    let header = jsonwebtoken::decode_header(encoded)
        .map_err(|e| Error::InvalidToken(format!("Malformed token header: {e}")))?;

    let mut parts = encoded.splitn(3, '.');
    let payload = parts
        .nth(1)
        .ok_or_else(|| Error::InvalidToken("Token is not in compact JWS form".to_string()))?;

    let payload = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        payload,
    )
    .map_err(|e| Error::InvalidToken(format!("Malformed token payload: {e}")))?;

    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| Error::InvalidToken(format!("Malformed token claims: {e}")))?;

    Ok((header, claims))
}

/// Verify a token's signature and standard claims.
///
/// # Errors
///
/// Returns [`Error::InvalidToken`] for signature or structural failures,
/// [`Error::Expired`] when `exp` has passed, [`Error::UntrustedIssuer`] when
/// `iss` differs from `expected_issuer`, and [`Error::WrongAudience`] when
/// `aud` matches none of `audiences`.
pub fn verify(
    encoded: &str,
    key: &DecodingKey,
    expected_issuer: &str,
    audiences: &[String],
) -> Result<Claims> {
    let header = jsonwebtoken::decode_header(encoded)
        .map_err(|e| Error::InvalidToken(format!("Malformed token header: {e}")))?;
    if header.alg != ALGORITHM {
        return Err(Error::InvalidToken(format!(
            "Unsupported algorithm {:?}, only RS256 is accepted",
            header.alg
        )));
    }

    let mut validation = Validation::new(ALGORITHM);
    validation.leeway = LEEWAY;
    // Audience and issuer are checked manually below: the audience claim may
    // be a string or an array, and both checks need distinct error variants.
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<Claims>(encoded, key, &validation).map_err(|e| {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::Expired,
            _ => Error::InvalidToken(e.to_string()),
        }
    })?;
    let claims = data.claims;

    let now = chrono::Utc::now().timestamp();
    if claims.iat > now + LEEWAY as i64 {
        return Err(Error::InvalidToken(
            "Token issued in the future".to_string(),
        ));
    }

    if claims.iss != expected_issuer {
        return Err(Error::UntrustedIssuer(claims.iss));
    }

    if !audiences.iter().any(|a| claims.aud.contains(a)) {
        return Err(Error::WrongAudience(claims.aud.primary().to_string()));
    }

    Ok(claims)
}
