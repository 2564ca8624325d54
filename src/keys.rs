//! Upstream signing-key cache.
//!
//! Maps `(issuer URL, kid)` to a verification key, filled on demand through
//! OIDC discovery: fetch the issuer's discovery document, follow its
//! `jwks_uri`, and select the JWK with the matching `kid`. Entries live for
//! the configured TTL (default 600 s) and the cache is bounded: when full,
//! the stalest entry is evicted.
//!
//! All fetches use a bounded timeout and are retried at most once, and only
//! on transient (connect/timeout) failures. An unknown `kid` after a fresh
//! fetch is a hard failure, not a retry loop.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Maximum number of cached keys.
const MAX_ENTRIES: usize = 16;

/// The subset of the OIDC discovery document we need.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

impl CachedKey {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

/// Cache of upstream issuer verification keys.
pub struct KeyCache {
    entries: DashMap<(String, String), CachedKey>,
    http: reqwest::Client,
    ttl: Duration,
}

impl KeyCache {
    /// Create with the given entry TTL and per-request timeout.
    #[must_use]
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            ttl,
        }
    }

    /// Get the verification key for `(issuer, kid)`, fetching on miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] if discovery or the JWKS fetch
    /// fails, and [`Error::UnknownKey`] if the issuer publishes no RSA key
    /// with that `kid`.
    pub async fn get(&self, issuer: &str, kid: &str) -> Result<DecodingKey> {
        let cache_key = (issuer.to_string(), kid.to_string());
        if let Some(cached) = self.entries.get(&cache_key) {
            if !cached.is_stale(self.ttl) {
                return Ok(cached.key.clone());
            }
        }

        if !issuer.starts_with("https://") {
            warn!(issuer = %issuer, "Issuer is not HTTPS");
        }

        let discovery_url = discovery_url(issuer);
        debug!(issuer = %issuer, kid = %kid, "Fetching signing key via {discovery_url}");
        let discovery: DiscoveryDocument = self.fetch_json(&discovery_url).await?;
        let jwks: JwkSet = self.fetch_json(&discovery.jwks_uri).await?;

        let key = find_key_in_jwks(&jwks, kid).ok_or_else(|| Error::UnknownKey {
            issuer: issuer.to_string(),
            kid: kid.to_string(),
        })?;

        self.evict_if_full();
        self.entries.insert(
            cache_key,
            CachedKey {
                key: key.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(key)
    }

    /// Number of cached entries (diagnostics and tests).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// GET a JSON document, retrying once on transient network failures.
    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        match self.try_fetch(url).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_timeout() || e.is_connect() => {
                debug!(url = %url, error = %e, "Transient fetch failure, retrying once");
                self.try_fetch(url).await.map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn try_fetch<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> std::result::Result<T, reqwest::Error> {
        self.http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn evict_if_full(&self) {
        if self.entries.len() < MAX_ENTRIES {
            return;
        }
        let stalest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().fetched_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = stalest {
            self.entries.remove(&key);
        }
    }
}

/// Derive the discovery document URL from the issuer URL.
fn discovery_url(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/openid-configuration")
}

/// Find an RSA JWK by `kid` and convert it to a verification key.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            _ => None,
        };
    }
    None
}
