//! The authorization decision endpoint (`GET /auth`).
//!
//! This is the nginx `auth_request` target: the proxy forwards every
//! protected request here as a sub-request and obeys the status code we
//! return. The procedure:
//!
//! 1. Parse the required scopes and `satisfy` strategy from the query.
//! 2. Locate a credential (cookie, then headers) and resolve it — a handle
//!    through the token store, a signed token through verification.
//! 3. Evaluate the capability pipeline: 403 with the reason on denial.
//! 4. Optionally reissue: an upstream token becomes a fresh session token;
//!    a default-audience token asked for the internal audience becomes a
//!    derived internal token, or a notebook token when `notebook=true`.
//! 5. Emit identity and scope headers for the proxy to copy upstream.
//!
//! Aside from the reissue cases, this endpoint never writes to storage.

use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use super::{ApiError, AppState, challenge, extract_client_ip, find_credential, resolve_credential};
use crate::access::Satisfy;
use crate::session::{self, State as SessionState};
use crate::tokens::TokenData;
use crate::{Error, Result};

/// Parsed `/auth` query parameters.
#[derive(Debug)]
struct AuthRequest {
    /// Scopes the resource requires. `capability` and `scope` are accepted
    /// interchangeably on the wire.
    required: Vec<String>,
    satisfy: Satisfy,
    audience: Option<String>,
    reissue: bool,
    /// Reissue into a notebook token (full scope) instead of an internal one.
    notebook: bool,
    service: Option<String>,
}

fn parse_query(query: Option<&str>) -> Result<AuthRequest> {
    let mut required = Vec::new();
    let mut satisfy = Satisfy::All;
    let mut audience = None;
    let mut reissue = false;
    let mut notebook = false;
    let mut service = None;

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "capability" | "scope" => {
                if !value.is_empty() {
                    required.push(value.into_owned());
                }
            }
            "satisfy" => satisfy = value.parse()?,
            "audience" => audience = Some(value.into_owned()),
            "reissue_token" => reissue = value.eq_ignore_ascii_case("true"),
            "notebook" => notebook = value.eq_ignore_ascii_case("true"),
            "service" => service = Some(value.into_owned()),
            _ => {}
        }
    }

    if required.is_empty() {
        return Err(Error::InvalidRequest(
            "At least one capability parameter is required".to_string(),
        ));
    }

    Ok(AuthRequest {
        required,
        satisfy,
        audience,
        reissue,
        notebook,
        service,
    })
}

/// `GET /auth` — authenticate and authorize a proxied request.
pub async fn authorize(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let request = match parse_query(query.as_deref()) {
        Ok(request) => request,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let ip = extract_client_ip(&headers);

    // Authentication
    let Some(credential) = find_credential(&state, &headers) else {
        return unauthenticated(&state, "No authorization credential found");
    };
    let data = match resolve_credential(&state, &credential).await {
        Ok(data) => data,
        Err(
            e @ (Error::Storage(_) | Error::UpstreamUnavailable(_) | Error::Internal(_)),
        ) => return ApiError::from(e).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to authenticate credential");
            return unauthenticated(&state, &e.to_string());
        }
    };

    // Authorization
    let decision = state
        .access
        .evaluate(&request.required, request.satisfy, &data.claims);

    let mut response_headers = HeaderMap::new();
    scope_headers(&state, &mut response_headers, &request, &data);

    if !decision.allowed {
        warn!(
            jti = %data.claims.jti,
            username = %data.claims.username(state.config.username_claim()),
            required = %request.required.join(" "),
            reason = %decision.reason,
            "Denied request"
        );
        return (StatusCode::FORBIDDEN, response_headers, decision.reason).into_response();
    }

    // Reissue, when requested
    let token = match reissue_if_needed(&state, &request, &data, ip.as_deref()).await {
        Ok(Reissue::Unchanged) => data.encoded.clone(),
        Ok(Reissue::Token(token)) => token,
        Ok(Reissue::NewSession { token, cookie }) => {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response_headers.insert(header::SET_COOKIE, value);
            }
            token
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    identity_headers(&state, &mut response_headers, &data, &token);

    info!(
        jti = %data.claims.jti,
        iss = %data.claims.iss,
        "Allowed request"
    );
    (StatusCode::OK, response_headers, String::new()).into_response()
}

/// Outcome of the reissue step.
enum Reissue {
    /// No reissue requested or applicable.
    Unchanged,
    /// A derived token replaces the presented one.
    Token(String),
    /// A fresh session was materialized; set the cookie too.
    NewSession { token: String, cookie: String },
}

/// Apply the two reissue rules.
///
/// A token from an upstream issuer marks a brand-new login: materialize it
/// into a self-signed session token with the default audience. A self-issued
/// default-audience token asked for the internal audience gets a derived
/// internal token instead.
async fn reissue_if_needed(
    state: &AppState,
    request: &AuthRequest,
    data: &TokenData,
    ip: Option<&str>,
) -> Result<Reissue> {
    if !request.reissue {
        return Ok(Reissue::Unchanged);
    }

    let config = &state.config;
    if data.claims.iss != config.issuer.url {
        let issued = state.tokens.verify_upstream(&data.encoded, ip).await?;
        let cookie_state = SessionState {
            handle: Some(issued.encoded_handle(&config.token_prefix)),
            csrf: Some(session::generate_csrf()),
            return_url: None,
            login_state: None,
        };
        let cookie = state.sessions.set_cookie(&cookie_state)?;
        return Ok(Reissue::NewSession {
            token: issued.record.token,
            cookie,
        });
    }

    let from_default = data.claims.aud.contains(&config.audience.default);
    if request.notebook && from_default {
        let issued = state.tokens.get_notebook_token(data, ip).await?;
        return Ok(Reissue::Token(issued.record.token));
    }

    let to_internal = request.audience.as_deref() == Some(config.audience.internal.as_str());
    if to_internal && from_default {
        let service = request.service.as_deref().unwrap_or("internal");
        let issued = state
            .tokens
            .get_internal_token(data, service, &request.required, ip)
            .await?;
        return Ok(Reissue::Token(issued.record.token));
    }

    Ok(Reissue::Unchanged)
}

/// Headers describing the authorization context. Set on 200 and 403 alike.
fn scope_headers(
    state: &AppState,
    headers: &mut HeaderMap,
    request: &AuthRequest,
    data: &TokenData,
) {
    let effective = state
        .access
        .effective_scopes(&data.claims)
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ");
    insert(headers, "X-Auth-Request-Token-Scopes", &effective);
    insert(
        headers,
        "X-Auth-Request-Scopes-Accepted",
        &request.required.join(" "),
    );
    insert(
        headers,
        "X-Auth-Request-Scopes-Satisfy",
        request.satisfy.as_str(),
    );
}

/// Identity headers for the proxy to forward. Success only.
fn identity_headers(state: &AppState, headers: &mut HeaderMap, data: &TokenData, token: &str) {
    let config = &state.config;
    insert(
        headers,
        "X-Auth-Request-User",
        data.claims.username(config.username_claim()),
    );
    if let Some(uid) = data.claims.uid(config.uid_claim()) {
        insert(headers, "X-Auth-Request-Uid", &uid.to_string());
    }
    if let Some(ref email) = data.claims.email {
        insert(headers, "X-Auth-Request-Email", email);
    }
    if !data.claims.groups.is_empty() {
        let groups = data
            .claims
            .groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        insert(headers, "X-Auth-Request-Groups", &groups);
    }
    insert(headers, "X-Auth-Request-Token", token);
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Build the 401 response with its `WWW-Authenticate` challenge.
fn unauthenticated(state: &AppState, description: &str) -> Response {
    let challenge_value = challenge(&state.config, "invalid_token", description);
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge_value)],
        description.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_query_requires_capability() {
        let err = parse_query(Some("satisfy=all")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(parse_query(None).is_err());
    }

    #[test]
    fn parse_query_collects_repeated_capabilities() {
        let request =
            parse_query(Some("capability=read:all&capability=write:all&satisfy=any")).unwrap();
        assert_eq!(request.required, vec!["read:all", "write:all"]);
        assert_eq!(request.satisfy, Satisfy::Any);
    }

    #[test]
    fn parse_query_accepts_scope_alias() {
        let request = parse_query(Some("scope=read:all")).unwrap();
        assert_eq!(request.required, vec!["read:all"]);
        assert_eq!(request.satisfy, Satisfy::All);
    }

    #[test]
    fn parse_query_rejects_bad_satisfy() {
        let err = parse_query(Some("capability=read:all&satisfy=some")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn parse_query_reissue_flag() {
        let request = parse_query(Some("capability=read:all&reissue_token=TRUE")).unwrap();
        assert!(request.reissue);
        let request = parse_query(Some("capability=read:all&reissue_token=yes")).unwrap();
        assert!(!request.reissue);
    }

    #[test]
    fn parse_query_audience_and_service() {
        let request = parse_query(Some(
            "capability=exec:internal&audience=https%3A%2F%2Fexample.com%2Fapi&service=portal",
        ))
        .unwrap();
        assert_eq!(request.audience.as_deref(), Some("https://example.com/api"));
        assert_eq!(request.service.as_deref(), Some("portal"));
    }
}
