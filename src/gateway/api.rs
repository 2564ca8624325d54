//! Token, session, and admin API handlers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/auth/tokens` | Create a user token (handle shown once) |
//! | `GET` | `/auth/tokens` | List the caller's active tokens |
//! | `GET` | `/auth/tokens/{key}` | Token metadata; 404 if foreign |
//! | `DELETE` | `/auth/tokens/{key}` | Revoke; 204 |
//! | `GET` | `/auth/api/v1/login` | Session bootstrap for API callers |
//! | `POST` | `/auth/api/v1/logout` | Revoke session, clear cookie |
//! | `GET` | `/auth/api/v1/admins` | List administrators |
//! | `POST` | `/auth/api/v1/admins` | Add an administrator |
//! | `DELETE` | `/auth/api/v1/admins/{username}` | Remove an administrator |
//!
//! Mutating endpoints authenticated via the session cookie additionally
//! require an `X-CSRF-Token` header matching the cookie state's CSRF token
//! (compared in constant time). Header-authenticated callers are exempt —
//! a cross-site request cannot set arbitrary headers.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    ApiError, AppState, Credential, authenticate_request, extract_client_ip,
};
use crate::session;
use crate::tokens::{CreateTokenRequest, TokenData, TokenRecord};
use crate::{Error, Result};

// ── DTOs ──────────────────────────────────────────────────────────────────

/// Token metadata returned by the listing and inspection endpoints.
///
/// Never includes the handle secret or the signed token.
#[derive(Debug, Serialize)]
pub struct TokenMetadata {
    /// The token's key (`jti`).
    pub key: String,
    /// Token kind.
    pub token_type: &'static str,
    /// Owning username.
    pub username: String,
    /// User-chosen name, for user tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    /// Consuming service, for internal tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Parent token key, for derived tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Creation time, epoch seconds.
    pub created_at: i64,
    /// Expiry time, epoch seconds.
    pub expires_at: i64,
}

impl From<TokenRecord> for TokenMetadata {
    fn from(record: TokenRecord) -> Self {
        Self {
            key: record.jti,
            token_type: record.token_type.as_str(),
            username: record.username,
            token_name: record.token_name,
            service: record.service,
            parent: record.parent_jti,
            scopes: record.scopes,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// Response of `GET /auth/api/v1/login`.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    /// CSRF token to send in `X-CSRF-Token` on mutating requests.
    pub csrf: String,
    /// Authenticated username.
    pub username: String,
    /// The session's effective scopes.
    pub scopes: Vec<String>,
}

/// Body of `POST /auth/api/v1/admins`.
#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    /// Username to add to the roster.
    pub username: String,
}

// ── Shared checks ─────────────────────────────────────────────────────────

fn auth_failure(state: &AppState, error: Error) -> ApiError {
    ApiError::with_challenge(error, &state.config)
}

async fn caller_is_admin(state: &AppState, data: &TokenData) -> Result<bool> {
    if data.claims.has_scope("admin:token") {
        return Ok(true);
    }
    state
        .admins
        .is_admin(data.claims.username(state.config.username_claim()))
        .await
}

/// Cookie-authenticated mutations must present the session's CSRF token.
fn require_csrf(credential: &Credential, headers: &HeaderMap) -> Result<()> {
    let Some(session) = credential.cookie_state() else {
        return Ok(());
    };
    let provided = headers
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if session.csrf_matches(provided) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(
            "Missing or incorrect X-CSRF-Token header".to_string(),
        ))
    }
}

fn username_of(state: &AppState, data: &TokenData) -> String {
    data.claims
        .username(state.config.username_claim())
        .to_string()
}

// ── Token endpoints ───────────────────────────────────────────────────────

/// `POST /auth/tokens` — create a user token.
pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTokenRequest>,
) -> std::result::Result<Response, ApiError> {
    let (credential, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    require_csrf(&credential, &headers)?;

    let is_admin = caller_is_admin(&state, &data).await?;
    let ip = extract_client_ip(&headers);
    let issued = state
        .tokens
        .create_user_token(&data, &request, is_admin, ip.as_deref())
        .await?;

    let body = json!({ "token": issued.encoded_handle(state.tokens.prefix()) });
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// `GET /auth/tokens` — list the caller's active tokens.
pub async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (_, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;

    let records = state.tokens.list(&username_of(&state, &data)).await?;
    let metadata: Vec<TokenMetadata> = records.into_iter().map(Into::into).collect();
    Ok(Json(metadata).into_response())
}

/// `GET /auth/tokens/{key}` — metadata for one token.
///
/// Someone else's token is indistinguishable from an absent one: both 404.
pub async fn get_token(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (_, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;

    let record = find_owned_record(&state, &key, &data).await?;
    Ok(Json(TokenMetadata::from(record)).into_response())
}

/// `DELETE /auth/tokens/{key}` — revoke a token.
pub async fn delete_token(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (credential, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    require_csrf(&credential, &headers)?;

    let record = find_owned_record(&state, &key, &data).await?;
    let actor = username_of(&state, &data);
    let ip = extract_client_ip(&headers);
    state
        .tokens
        .revoke_by_key(&record.jti, &actor, ip.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Fetch a record the caller owns (or may administer); foreign and absent
/// records both come back as `NotFound`.
async fn find_owned_record(
    state: &AppState,
    key: &str,
    data: &TokenData,
) -> Result<TokenRecord> {
    let not_found = || Error::NotFound(format!("No such token: {key}"));
    let record = state.tokens.get_record(key).await?.ok_or_else(not_found)?;
    if record.username != username_of(state, data) && !caller_is_admin(state, data).await? {
        return Err(not_found());
    }
    Ok(record)
}

// ── Session endpoints ─────────────────────────────────────────────────────

/// `GET /auth/api/v1/login` — establish or refresh an API session.
///
/// Returns the CSRF token, username, and effective scopes, and (re)sets the
/// session cookie. An upstream identity token is materialized into a
/// session token first, so the cookie always references a self-issued
/// token.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (credential, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    let ip = extract_client_ip(&headers);

    // Start from the existing cookie state, if any.
    let mut session_state = credential.cookie_state().cloned().unwrap_or_default();

    // Make sure the cookie references a handle backed by our own store.
    let data = if data.claims.iss == state.config.issuer.url {
        if session_state.handle.is_none()
            && crate::handle::Handle::decode(state.tokens.prefix(), &credential.value).is_some()
        {
            session_state.handle = Some(credential.value.clone());
        }
        data
    } else {
        let issued = state
            .tokens
            .verify_upstream(&data.encoded, ip.as_deref())
            .await?;
        session_state.handle = Some(issued.encoded_handle(state.tokens.prefix()));
        let (_, claims) = crate::jwt::decode_unverified(&issued.record.token)?;
        TokenData {
            claims,
            encoded: issued.record.token,
        }
    };

    if session_state.csrf.is_none() {
        session_state.csrf = Some(session::generate_csrf());
    }

    let response = LoginResponse {
        csrf: session_state.csrf.clone().unwrap_or_default(),
        username: username_of(&state, &data),
        scopes: state
            .access
            .effective_scopes(&data.claims)
            .into_iter()
            .collect(),
    };
    let cookie = state.sessions.set_cookie(&session_state)?;

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(response),
    )
        .into_response())
}

/// `POST /auth/api/v1/logout` — revoke the session token and clear the
/// cookie.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let cookie_header = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(session_state) = state.sessions.state_from_cookie_header(cookie_header) else {
        return Err(auth_failure(
            &state,
            Error::Unauthenticated("No session cookie".to_string()),
        ));
    };

    let credential = Credential {
        value: session_state.handle.clone().unwrap_or_default(),
        source: super::CredentialSource::Cookie(session_state.clone()),
    };
    require_csrf(&credential, &headers)?;

    if let Some(ref serialized) = session_state.handle {
        if let Some(handle) = crate::handle::Handle::decode(state.tokens.prefix(), serialized) {
            let actor = match state.tokens.get_data(&handle).await? {
                Some(data) => username_of(&state, &data),
                None => "<expired>".to_string(),
            };
            let ip = extract_client_ip(&headers);
            state.tokens.revoke(&handle, &actor, ip.as_deref()).await?;
        }
    }

    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, state.sessions.clear_cookie())],
    )
        .into_response())
}

// ── Admin endpoints ───────────────────────────────────────────────────────

async fn require_admin(state: &AppState, data: &TokenData) -> Result<()> {
    if caller_is_admin(state, data).await? {
        Ok(())
    } else {
        Err(Error::PermissionDenied(
            "Administrator access required".to_string(),
        ))
    }
}

/// `GET /auth/api/v1/admins` — the current roster.
pub async fn list_admins(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (_, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    require_admin(&state, &data).await?;

    let admins = state.admins.list().await?;
    Ok(Json(admins).into_response())
}

/// `POST /auth/api/v1/admins` — add an administrator.
pub async fn add_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AddAdminRequest>,
) -> std::result::Result<Response, ApiError> {
    let (credential, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    require_csrf(&credential, &headers)?;
    require_admin(&state, &data).await?;

    let actor = username_of(&state, &data);
    let ip = extract_client_ip(&headers);
    state
        .admins
        .add(&request.username, &actor, ip.as_deref())
        .await?;

    let body = json!({ "username": request.username });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// `DELETE /auth/api/v1/admins/{username}` — remove an administrator.
///
/// The roster can never be emptied: removing the final administrator is
/// rejected, otherwise nobody could administer the gateway.
pub async fn remove_admin(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let (credential, data) = authenticate_request(&state, &headers)
        .await
        .map_err(|e| auth_failure(&state, e))?;
    require_csrf(&credential, &headers)?;
    require_admin(&state, &data).await?;

    let roster = state.admins.list().await?;
    if roster == vec![username.clone()] {
        return Err(ApiError::from(Error::Validation(
            "Cannot remove the last administrator".to_string(),
        )));
    }

    let actor = username_of(&state, &data);
    let ip = extract_client_ip(&headers);
    let removed = state
        .admins
        .remove(&username, &actor, ip.as_deref())
        .await?;
    if removed {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError::from(Error::NotFound(format!(
            "{username} is not an administrator"
        ))))
    }
}
