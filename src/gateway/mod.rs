//! HTTP gateway: server construction, the decision endpoint, and the token
//! and admin APIs.

pub mod api;
pub mod auth;
mod server;

pub use server::{AppState, Gateway};

use axum::{
    Json,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::config::ChallengeType;
use crate::session::State;
use crate::tokens::TokenData;
use crate::{Error, Result};

// ── Credential extraction ─────────────────────────────────────────────────

/// Where the request's credential came from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Decrypted from the session cookie; carries the full cookie state.
    Cookie(State),
    /// Taken from a request header.
    Header,
}

/// A located credential: the bearer string plus its provenance.
#[derive(Debug, Clone)]
pub struct Credential {
    /// The credential itself — a serialized handle or an encoded JWT.
    pub value: String,
    /// Where it was found.
    pub source: CredentialSource,
}

impl Credential {
    /// The cookie state, when the credential came from the session cookie.
    #[must_use]
    pub fn cookie_state(&self) -> Option<&State> {
        match &self.source {
            CredentialSource::Cookie(state) => Some(state),
            CredentialSource::Header => None,
        }
    }
}

/// Locate a credential in priority order: session cookie, `Authorization:
/// Bearer`, `X-Forwarded-Access-Token`, `X-Forwarded-Id-Token`,
/// `Authorization: Basic`.
///
/// For Basic credentials the token rides in the password slot (or in the
/// username slot when the password is the sentinel `x-oauth-basic`).
#[must_use]
pub fn find_credential(state: &AppState, headers: &HeaderMap) -> Option<Credential> {
    if let Some(cookie_header) = header_str(headers, &header::COOKIE) {
        if let Some(session) = state.sessions.state_from_cookie_header(cookie_header) {
            if let Some(handle) = session.handle.clone() {
                return Some(Credential {
                    value: handle,
                    source: CredentialSource::Cookie(session),
                });
            }
        }
    }

    let authorization = header_str(headers, &header::AUTHORIZATION);
    if let Some(token) = authorization.and_then(bearer_token) {
        return Some(Credential {
            value: token.to_string(),
            source: CredentialSource::Header,
        });
    }

    for name in ["x-forwarded-access-token", "x-forwarded-id-token"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(Credential {
                    value: value.to_string(),
                    source: CredentialSource::Header,
                });
            }
        }
    }

    if let Some(token) = authorization.and_then(basic_token) {
        return Some(Credential {
            value: token,
            source: CredentialSource::Header,
        });
    }

    None
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extract a token from `Authorization: Basic`, honoring the
/// `x-oauth-basic` sentinel in either slot.
fn basic_token(value: &str) -> Option<String> {
    let blob = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, blob.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;

    let token = if password == "x-oauth-basic" {
        user
    } else if user == "x-oauth-basic" {
        password
    } else {
        // No sentinel: assume the token is in the username slot.
        user
    };
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve a located credential to a verified token.
///
/// Handle-shaped credentials go through the token store; anything else is
/// treated as a signed token and verified.
///
/// # Errors
///
/// Returns [`Error::Unauthenticated`] for unknown handles and the JWT error
/// taxonomy for signed-token failures.
pub async fn resolve_credential(state: &AppState, credential: &Credential) -> Result<TokenData> {
    if let Some(handle) = crate::handle::Handle::decode(state.tokens.prefix(), &credential.value) {
        return match state.tokens.get_data(&handle).await? {
            Some(data) => Ok(data),
            None => Err(Error::Unauthenticated(
                "Unknown or revoked token handle".to_string(),
            )),
        };
    }
    state.tokens.verify(&credential.value).await
}

/// Locate and resolve a credential in one step.
///
/// # Errors
///
/// Returns [`Error::Unauthenticated`] when no credential is present, plus
/// everything [`resolve_credential`] can return.
pub async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Credential, TokenData)> {
    let credential = find_credential(state, headers)
        .ok_or_else(|| Error::Unauthenticated("No authorization credential found".to_string()))?;
    let data = resolve_credential(state, &credential).await?;
    Ok((credential, data))
}

/// Client IP from `X-Forwarded-For` or `X-Real-IP`.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

// ── Error mapping ─────────────────────────────────────────────────────────

/// Build the `WWW-Authenticate` challenge header value for a 401.
#[must_use]
pub fn challenge(config: &crate::config::Config, error: &str, description: &str) -> String {
    match config.www_authenticate {
        ChallengeType::Basic => format!("Basic realm=\"{}\"", config.realm),
        ChallengeType::Bearer => format!(
            "Bearer realm=\"{}\", error=\"{error}\", error_description=\"{description}\"",
            config.realm
        ),
    }
}

/// Wraps [`Error`] for axum handlers, mapping the taxonomy onto HTTP.
pub struct ApiError {
    error: Error,
    realm_challenge: Option<String>,
}

impl ApiError {
    /// Attach a `WWW-Authenticate` challenge (for 401 responses).
    #[must_use]
    pub fn with_challenge(error: Error, config: &crate::config::Config) -> Self {
        let challenge_value = challenge(config, error.challenge_code(), &error.to_string());
        Self {
            error,
            realm_challenge: Some(challenge_value),
        }
    }

    fn status(&self) -> StatusCode {
        match self.error {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthenticated(_)
            | Error::InvalidToken(_)
            | Error::Expired
            | Error::UntrustedIssuer(_)
            | Error::WrongAudience(_)
            | Error::UnknownKey { .. } => StatusCode::UNAUTHORIZED,
            Error::Denied(_) | Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) | Error::InsufficientLifetime { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.error {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthenticated(_)
            | Error::InvalidToken(_)
            | Error::Expired
            | Error::UntrustedIssuer(_)
            | Error::WrongAudience(_)
            | Error::UnknownKey { .. } => "invalid_token",
            Error::Denied(_) | Error::PermissionDenied(_) => "access_denied",
            Error::NotFound(_) => "not_found",
            Error::Validation(_) | Error::InsufficientLifetime { .. } => "validation_failed",
            _ => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            error,
            realm_challenge: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.error, "Internal error");
        }
        let body = Json(json!({
            "error": self.code(),
            "message": self.error.to_string(),
        }));
        match self.realm_challenge {
            Some(challenge_value) if status == StatusCode::UNAUTHORIZED => {
                (status, [("WWW-Authenticate", challenge_value)], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn basic_token_sentinel_in_password() {
        // token:x-oauth-basic — the recommended form
        let blob = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "my-token:x-oauth-basic",
        );
        assert_eq!(
            basic_token(&format!("Basic {blob}")).as_deref(),
            Some("my-token")
        );
    }

    #[test]
    fn basic_token_sentinel_in_username() {
        let blob = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "x-oauth-basic:my-token",
        );
        assert_eq!(
            basic_token(&format!("Basic {blob}")).as_deref(),
            Some("my-token")
        );
    }

    #[test]
    fn basic_token_without_sentinel_uses_username() {
        let blob = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "my-token:password",
        );
        assert_eq!(
            basic_token(&format!("Basic {blob}")).as_deref(),
            Some("my-token")
        );
    }

    #[test]
    fn basic_token_rejects_malformed() {
        assert!(basic_token("Basic not-base64!!!").is_none());
        let blob = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            "no-colon-here",
        );
        assert!(basic_token(&format!("Basic {blob}")).is_none());
    }

    #[test]
    fn client_ip_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("10.1.2.3"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.1.9".parse().unwrap());
        assert_eq!(extract_client_ip(&headers).as_deref(), Some("192.168.1.9"));

        assert!(extract_client_ip(&HeaderMap::new()).is_none());
    }

    #[test]
    fn challenge_formats() {
        let mut config = test_config();
        let value = challenge(&config, "invalid_token", "Token has expired");
        assert!(value.starts_with("Bearer realm=\"example.com\""));
        assert!(value.contains("error=\"invalid_token\""));
        assert!(value.contains("error_description=\"Token has expired\""));

        config.www_authenticate = ChallengeType::Basic;
        assert_eq!(
            challenge(&config, "invalid_token", "ignored"),
            "Basic realm=\"example.com\""
        );
    }
}
