//! Authentication and authorization gateway.
//!
//! Sits behind a reverse proxy that supports sub-request authentication
//! (nginx `auth_request`) and centralizes login, session, and token
//! management for a cluster of HTTP services.
//!
//! # Features
//!
//! - **Decision endpoint**: `GET /auth` authenticates the caller and checks
//!   required scopes on every proxied request
//! - **Token lifecycle**: session, user, internal, and notebook tokens with
//!   opaque handles, revocation, and single-flight derivation
//! - **Upstream identity**: OIDC-style issuers verified through cached JWKS
//!   keys and materialized into self-issued session tokens
//! - **Encrypted sessions**: AES-256-GCM cookie carrying a token handle and
//!   CSRF token
//! - **Pluggable authorization**: named capability checkers composed
//!   conjunctively, configured per deployment

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod admin;
pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handle;
pub mod jwt;
pub mod keys;
pub mod session;
pub mod storage;
pub mod testing;
pub mod tokens;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
