//! End-to-end tests for the `/auth` decision endpoint.
//!
//! Each test drives the full router: credential extraction, token
//! resolution, the capability pipeline, reissue, and response headers.

mod common;

use authgate::testing::{TEST_INTERNAL_AUDIENCE, TEST_ISSUER_URL, test_config};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn allow_by_scope() {
    // GIVEN: a session token holding read:all and user:token
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all", "user:token"]).await;
    let handle = handle_of(gateway.state(), &issued);

    // WHEN: the proxy asks for read:all
    let response =
        get_with_bearer(&gateway, "/auth?capability=read:all&satisfy=all", &handle).await;

    // THEN: 200 with identity and scope headers
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get("X-Auth-Request-Token-Scopes").unwrap(),
        "read:all user:token"
    );
    assert_eq!(headers.get("X-Auth-Request-Scopes-Accepted").unwrap(), "read:all");
    assert_eq!(headers.get("X-Auth-Request-Scopes-Satisfy").unwrap(), "all");
    assert_eq!(headers.get("X-Auth-Request-User").unwrap(), "alice");
    assert_eq!(headers.get("X-Auth-Request-Uid").unwrap(), "4510");
    // The email header comes from the email claim, never the uid
    assert_eq!(
        headers.get("X-Auth-Request-Email").unwrap(),
        "alice@example.com"
    );
    assert_eq!(headers.get("X-Auth-Request-Groups").unwrap(), "staff");
    assert!(headers.get("X-Auth-Request-Token").is_some());
}

#[tokio::test]
async fn allow_by_group_membership() {
    // GIVEN: group_membership checking and a token with an empty scope but
    // membership in the group mapped to exec:admin
    let mut config = test_config();
    config.access_checks = vec!["group_membership".to_string()];
    let gateway = authgate::gateway::Gateway::new(config).await.unwrap();

    let mut user = alice();
    user.groups = vec![authgate::jwt::Group {
        name: "admins".to_string(),
        id: 1000,
    }];
    let issued = session(gateway.state(), &user, &[]).await;
    let handle = handle_of(gateway.state(), &issued);

    // WHEN: the proxy asks for exec:admin
    let response = get_with_bearer(&gateway, "/auth?capability=exec:admin", &handle).await;

    // THEN: membership alone satisfies the check
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn deny_names_the_missing_scope() {
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let response = get_with_bearer(&gateway, "/auth?capability=write:all", &handle).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // Scope headers still describe the request on denial
    assert_eq!(
        response
            .headers()
            .get("X-Auth-Request-Scopes-Accepted")
            .unwrap(),
        "write:all"
    );
    let body = body_string(response).await;
    assert!(body.contains("write:all"), "denial body was: {body}");
}

#[tokio::test]
async fn expired_token_is_unauthorized() {
    // GIVEN: a self-issued JWT that expired beyond the leeway
    let gateway = build_gateway().await;
    let token = sign_own_token(&alice(), "read:all", -120);

    let response = get_with_bearer(&gateway, "/auth?capability=read:all", &token).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("WWW-Authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(challenge.contains("error=\"invalid_token\""), "{challenge}");
    assert!(
        challenge.to_lowercase().contains("expired"),
        "challenge should mention expiry: {challenge}"
    );
}

#[tokio::test]
async fn satisfy_any_allows_partial_match() {
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let response = get_with_bearer(
        &gateway,
        "/auth?capability=write:all&capability=read:all&satisfy=any",
        &handle,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get_with_bearer(
        &gateway,
        "/auth?capability=write:all&capability=read:all&satisfy=all",
        &handle,
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn reissue_to_internal_audience() {
    // GIVEN: a default-audience session with exec:internal
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["exec:internal"]).await;
    let handle = handle_of(gateway.state(), &issued);
    let parent_exp = issued.record.expires_at;

    // WHEN: the proxy requests reissue toward the internal audience
    let uri = format!(
        "/auth?capability=exec:internal&audience={}&reissue_token=true&service=portal",
        urlencode(TEST_INTERNAL_AUDIENCE)
    );
    let response = get_with_bearer(&gateway, &uri, &handle).await;

    // THEN: the emitted token is a fresh internal token
    assert_eq!(response.status(), StatusCode::OK);
    let token = response
        .headers()
        .get("X-Auth-Request-Token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(token, issued.record.token);

    let (_, claims) = authgate::jwt::decode_unverified(&token).unwrap();
    assert_eq!(claims.iss, TEST_ISSUER_URL);
    assert!(claims.aud.contains(TEST_INTERNAL_AUDIENCE));
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.scope, "exec:internal");
    assert_eq!(claims.exp, parent_exp);

    let now = chrono::Utc::now().timestamp();
    assert!(claims.exp - now >= 300);
    assert!(claims.exp - now <= parent_exp - now);
}

#[tokio::test]
async fn reissue_to_notebook_token() {
    // GIVEN: a session with two scopes
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["exec:internal", "read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    // WHEN: a notebook reissue is requested
    let response = get_with_bearer(
        &gateway,
        "/auth?capability=read:all&reissue_token=true&notebook=true",
        &handle,
    )
    .await;

    // THEN: the emitted token carries the session's full scope
    assert_eq!(response.status(), StatusCode::OK);
    let token = response
        .headers()
        .get("X-Auth-Request-Token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(token, issued.record.token);
    let (_, claims) = authgate::jwt::decode_unverified(&token).unwrap();
    assert_eq!(claims.scope, "exec:internal read:all");
    assert_eq!(claims.sub, "alice");
}

#[tokio::test]
async fn reissue_without_audience_is_a_no_op() {
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let response =
        get_with_bearer(&gateway, "/auth?capability=read:all&reissue_token=true", &handle).await;

    assert_eq!(response.status(), StatusCode::OK);
    let token = response
        .headers()
        .get("X-Auth-Request-Token")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(token, issued.record.token);
}

#[tokio::test]
async fn tampered_handle_is_unauthorized() {
    // GIVEN: a valid handle with the last character of the secret flipped
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let mut handle = handle_of(gateway.state(), &issued);
    let last = handle.pop().unwrap();
    handle.push(if last == 'A' { 'B' } else { 'A' });

    let response = get_with_bearer(&gateway, "/auth?capability=read:all", &handle).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("WWW-Authenticate").is_some());
}

#[tokio::test]
async fn revoked_handle_is_unauthorized() {
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let response = get_with_bearer(&gateway, "/auth?capability=read:all", &handle).await;
    assert_eq!(response.status(), StatusCode::OK);

    gateway
        .state()
        .tokens
        .revoke(&issued.handle, "alice", None)
        .await
        .unwrap();

    let response = get_with_bearer(&gateway, "/auth?capability=read:all", &handle).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_capability_is_bad_request() {
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let response = get_with_bearer(&gateway, "/auth", &handle).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get_with_bearer(&gateway, "/auth?capability=read:all&satisfy=most", &handle).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn no_credential_is_unauthorized_with_challenge() {
    let gateway = build_gateway().await;

    let request = Request::builder()
        .uri("/auth?capability=read:all")
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("WWW-Authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.starts_with("Bearer realm=\"example.com\""));
}

#[tokio::test]
async fn basic_credential_carries_the_token() {
    // GIVEN: the handle in the username slot with the x-oauth-basic sentinel
    let gateway = build_gateway().await;
    let issued = session(gateway.state(), &alice(), &["read:all"]).await;
    let handle = handle_of(gateway.state(), &issued);

    let blob = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        format!("{handle}:x-oauth-basic"),
    );
    let request = Request::builder()
        .uri("/auth?capability=read:all")
        .header("Authorization", format!("Basic {blob}"))
        .body(Body::empty())
        .unwrap();

    let response = send(&gateway, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_access_token_header_is_honored() {
    let gateway = build_gateway().await;
    let token = sign_own_token(&alice(), "read:all", 3600);

    let request = Request::builder()
        .uri("/auth?capability=read:all")
        .header("x-forwarded-access-token", token)
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn session_cookie_is_a_credential() {
    // GIVEN: an encrypted session cookie carrying the handle
    let gateway = build_gateway().await;
    let state = gateway.state();
    let issued = session(state, &alice(), &["read:all"]).await;

    let cookie_state = authgate::session::State {
        handle: Some(handle_of(state, &issued)),
        csrf: Some(authgate::session::generate_csrf()),
        return_url: None,
        login_state: None,
    };
    let set_cookie = state.sessions.set_cookie(&cookie_state).unwrap();

    let request = Request::builder()
        .uri("/auth?capability=read:all")
        .header("Cookie", cookie_pair(&set_cookie))
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tampered_cookie_is_anonymous() {
    let gateway = build_gateway().await;
    let state = gateway.state();
    let issued = session(state, &alice(), &["read:all"]).await;

    let cookie_state = authgate::session::State {
        handle: Some(handle_of(state, &issued)),
        csrf: None,
        return_url: None,
        login_state: None,
    };
    let set_cookie = state.sessions.set_cookie(&cookie_state).unwrap();
    let mut pair = cookie_pair(&set_cookie);
    let last = pair.pop().unwrap();
    pair.push(if last == 'A' { 'B' } else { 'A' });

    // A cookie that fails decryption is treated as absent, so with no other
    // credential the request is unauthenticated rather than an error.
    let request = Request::builder()
        .uri("/auth?capability=read:all")
        .header("Cookie", pair)
        .body(Body::empty())
        .unwrap();
    let response = send(&gateway, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
