//! Shared support for the integration tests.
//!
//! Everything runs against an in-memory gateway assembled from
//! `authgate::testing::test_config()` with embedded RSA keys; requests are
//! driven straight into the router, no sockets involved.

#![allow(dead_code)]

use std::collections::HashMap;

use authgate::gateway::{AppState, Gateway};
use authgate::jwt::{self, Audience, Claims, Group};
use authgate::testing::{TEST_AUDIENCE, TEST_ISSUER_PRIVATE_PEM, TEST_ISSUER_URL, test_config};
use authgate::tokens::{Issued, UserInfo};
use axum::body::Body;
use axum::http::{Request, Response};
use tower::ServiceExt;

/// A gateway over the in-memory store, with `alice` seeded as admin.
pub async fn build_gateway() -> Gateway {
    let mut config = test_config();
    config.admins = vec!["admin-user".to_string()];
    Gateway::new(config).await.expect("gateway builds")
}

pub fn alice() -> UserInfo {
    UserInfo {
        username: "alice".to_string(),
        uid: 4510,
        email: Some("alice@example.com".to_string()),
        groups: vec![Group {
            name: "staff".to_string(),
            id: 200,
        }],
    }
}

pub fn bob() -> UserInfo {
    UserInfo {
        username: "bob".to_string(),
        uid: 4511,
        email: None,
        groups: Vec::new(),
    }
}

pub fn admin_user() -> UserInfo {
    UserInfo {
        username: "admin-user".to_string(),
        uid: 1,
        email: None,
        groups: Vec::new(),
    }
}

/// Create a session token for a user and return the issuance.
pub async fn session(state: &AppState, user: &UserInfo, scopes: &[&str]) -> Issued {
    let scopes: Vec<String> = scopes.iter().map(|s| (*s).to_string()).collect();
    state
        .tokens
        .create_session_token(user, &scopes, None)
        .await
        .expect("session token issued")
}

/// The serialized handle for an issuance.
pub fn handle_of(state: &AppState, issued: &Issued) -> String {
    issued.encoded_handle(state.tokens.prefix())
}

/// Sign a raw self-issued JWT directly, bypassing the token store.
///
/// Useful for expiry and tampering scenarios the service itself would
/// refuse to create.
pub fn sign_own_token(user: &UserInfo, scope: &str, exp_offset: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let mut extra = HashMap::new();
    extra.insert("uid".to_string(), serde_json::json!(user.username));
    extra.insert("uidNumber".to_string(), serde_json::json!(user.uid));
    let claims = Claims {
        iss: TEST_ISSUER_URL.to_string(),
        aud: Audience::Single(TEST_AUDIENCE.to_string()),
        sub: user.username.clone(),
        iat: now,
        exp: now + exp_offset,
        jti: "raw-token".to_string(),
        email: user.email.clone(),
        groups: user.groups.clone(),
        scope: scope.to_string(),
        extra,
    };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(TEST_ISSUER_PRIVATE_PEM.as_bytes()).unwrap();
    jwt::sign(&claims, &key, Some("test-kid".to_string())).unwrap()
}

/// Drive a request through the router.
pub async fn send(gateway: &Gateway, request: Request<Body>) -> Response<Body> {
    gateway
        .router()
        .oneshot(request)
        .await
        .expect("router responds")
}

/// Shorthand for a GET with a bearer credential.
pub async fn get_with_bearer(gateway: &Gateway, uri: &str, bearer: &str) -> Response<Body> {
    let request = Request::builder()
        .uri(uri)
        .header("Authorization", format!("Bearer {bearer}"))
        .body(Body::empty())
        .unwrap();
    send(gateway, request).await
}

/// Collect a response body as a string.
pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body collects");
    String::from_utf8(bytes.to_vec()).expect("body is UTF-8")
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).expect("body is JSON")
}

/// The `name=value` pair from a `Set-Cookie` header, for replay in a
/// `Cookie` request header.
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie
        .split(';')
        .next()
        .expect("set-cookie has a value")
        .to_string()
}
