//! Token issuance, derivation, lookup, and revocation.
//!
//! Every path that creates a token funnels through [`TokenService::issue`]:
//! mint a handle, sign the claims with our RS256 key, persist the record
//! under the handle's key, emit an audit event. Issuance is a single store
//! `put` — an interrupted request either left no trace or a fully live
//! token, never something in between.
//!
//! Derived (internal and notebook) tokens are deduplicated per
//! `(parent_jti, service, sorted scopes)` fingerprint: the lookup-or-mint
//! sequence runs under a per-fingerprint async lock, so concurrent requests
//! for the same derivation observe one `jti` and exactly one store write.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Issued, TokenCache, TokenData, TokenRecord, TokenType, UserInfo};
use crate::audit::{self, AuditEvent};
use crate::config::{Config, MINIMUM_LIFETIME, is_valid_username};
use crate::handle::Handle;
use crate::jwt::{self, Audience, Claims};
use crate::keys::KeyCache;
use crate::storage::TokenStore;
use crate::{Error, Result};

/// Body of `POST /auth/tokens`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTokenRequest {
    /// Username the token is created for.
    pub username: String,
    /// User-chosen display name for the token.
    pub token_name: String,
    /// Scopes to grant.
    pub scopes: Vec<String>,
    /// Expiry as epoch seconds.
    pub expires: i64,
}

/// The token service.
pub struct TokenService {
    config: Arc<Config>,
    store: Arc<dyn TokenStore>,
    keys: Arc<KeyCache>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    cache: TokenCache,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl TokenService {
    /// Build the service from configuration and shared components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the issuer key material is unusable.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn TokenStore>,
        keys: Arc<KeyCache>,
    ) -> Result<Self> {
        let encoding_key = config.encoding_key()?;
        let decoding_key = config.decoding_key()?;
        let cache = TokenCache::new(config.token_cache_size);
        Ok(Self {
            config,
            store,
            keys,
            encoding_key,
            decoding_key,
            cache,
        })
    }

    /// The configured handle prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.token_prefix
    }

    // ── Issuance ──────────────────────────────────────────────────────────

    /// Mint a session token for a freshly authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for unknown scopes and
    /// [`Error::Storage`] if persistence fails.
    pub async fn create_session_token(
        &self,
        user: &UserInfo,
        scopes: &[String],
        ip: Option<&str>,
    ) -> Result<Issued> {
        self.require_known_scopes(scopes)?;
        let scopes = sorted(scopes);
        let lifetime = i64::try_from(self.config.token_lifetime.as_secs())
            .map_err(|_| Error::Config("token_lifetime out of range".to_string()))?;
        self.issue(IssueParams {
            user,
            token_type: TokenType::Session,
            scopes: &scopes,
            expires_at: now() + lifetime,
            audience: &self.config.audience.default,
            parent_jti: None,
            service: None,
            token_name: None,
            ip,
        })
        .await
    }

    /// Create a long-lived user token through the API.
    ///
    /// The actor (the parent token) must own the target username or be an
    /// administrator, must hold `user:token`, and may only grant scopes it
    /// holds itself; administrators bypass the ownership and subset rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed usernames, unknown
    /// scopes, or an expiry closer than the minimum lifetime, and
    /// [`Error::PermissionDenied`] for ownership or privilege failures.
    pub async fn create_user_token(
        &self,
        parent: &TokenData,
        request: &CreateTokenRequest,
        actor_is_admin: bool,
        ip: Option<&str>,
    ) -> Result<Issued> {
        if !is_valid_username(&request.username) {
            return Err(Error::Validation(format!(
                "Invalid username: {}",
                request.username
            )));
        }
        self.require_known_scopes(&request.scopes)?;

        let minimum = i64::try_from(MINIMUM_LIFETIME.as_secs()).unwrap_or(i64::MAX);
        let remaining = request.expires - now();
        if remaining < minimum {
            return Err(Error::Validation(format!(
                "Token lifetime of {remaining}s is below the minimum of {minimum}s"
            )));
        }

        let actor = self.username_of(&parent.claims);
        if !actor_is_admin {
            if actor != request.username {
                return Err(Error::PermissionDenied(format!(
                    "{actor} may not create tokens for {}",
                    request.username
                )));
            }
            if !parent.claims.has_scope("user:token") {
                return Err(Error::PermissionDenied(
                    "Creating tokens requires the user:token scope".to_string(),
                ));
            }
            let parent_scopes = self.effective_scopes(&parent.claims);
            if let Some(excess) = request.scopes.iter().find(|s| !parent_scopes.contains(*s)) {
                return Err(Error::PermissionDenied(format!(
                    "Requested scope {excess} exceeds the parent token's scopes"
                )));
            }
        }

        let user = if actor == request.username {
            UserInfo::from_claims(&parent.claims, &self.config)
        } else {
            UserInfo {
                username: request.username.clone(),
                uid: 0,
                email: None,
                groups: Vec::new(),
            }
        };

        let scopes = sorted(&request.scopes);
        self.issue(IssueParams {
            user: &user,
            token_type: TokenType::User,
            scopes: &scopes,
            expires_at: request.expires,
            audience: &self.config.audience.default,
            parent_jti: None,
            service: None,
            token_name: Some(request.token_name.clone()),
            ip,
        })
        .await
    }

    /// Get (or mint) an internal token for machine-to-machine calls.
    ///
    /// Idempotent per `(parent_jti, service, sorted scopes)` while cached:
    /// concurrent calls with the same fingerprint return the same `jti`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientLifetime`] when the parent expires too
    /// soon, [`Error::Validation`] for unknown scopes, and
    /// [`Error::PermissionDenied`] if the scopes exceed the parent's.
    pub async fn get_internal_token(
        &self,
        parent: &TokenData,
        service: &str,
        scopes: &[String],
        ip: Option<&str>,
    ) -> Result<Issued> {
        if service.is_empty() {
            return Err(Error::Validation("service must not be empty".to_string()));
        }
        self.require_known_scopes(scopes)?;
        let parent_scopes = self.effective_scopes(&parent.claims);
        if let Some(excess) = scopes.iter().find(|s| !parent_scopes.contains(*s)) {
            return Err(Error::PermissionDenied(format!(
                "Requested scope {excess} exceeds the parent token's scopes"
            )));
        }

        let scopes = sorted(scopes);
        let fingerprint = format!(
            "{}:{service}:{}",
            parent.claims.jti,
            scopes.join(",")
        );
        self.derive(
            parent,
            TokenType::Internal,
            &scopes,
            &self.config.audience.internal,
            Some(service.to_string()),
            &fingerprint,
            ip,
        )
        .await
    }

    /// Get (or mint) a notebook token carrying the parent's full scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientLifetime`] when the parent expires too
    /// soon.
    pub async fn get_notebook_token(
        &self,
        parent: &TokenData,
        ip: Option<&str>,
    ) -> Result<Issued> {
        let scopes: Vec<String> = self.effective_scopes(&parent.claims).into_iter().collect();
        let fingerprint = format!("{}:notebook", parent.claims.jti);
        self.derive(
            parent,
            TokenType::Notebook,
            &scopes,
            &self.config.audience.default,
            None,
            &fingerprint,
            ip,
        )
        .await
    }

    // ── Lookup & verification ─────────────────────────────────────────────

    /// Resolve a handle to its token. No network I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] only for store failures; an unknown or
    /// tampered handle is `Ok(None)`.
    pub async fn get_data(&self, handle: &Handle) -> Result<Option<TokenData>> {
        let Some(record) = self.store.get(handle).await? else {
            return Ok(None);
        };
        let (_, claims) = jwt::decode_unverified(&record.token)?;
        Ok(Some(TokenData {
            claims,
            encoded: record.token,
        }))
    }

    /// Fetch a record by its key (`jti`) alone, without secret proof.
    ///
    /// Only for owner-checked API paths (list/inspect/revoke one's own
    /// tokens); everything credential-shaped goes through [`Self::get_data`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn get_record(&self, key: &str) -> Result<Option<TokenRecord>> {
        self.store.get_raw(key).await
    }

    /// All active tokens for a user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn list(&self, username: &str) -> Result<Vec<TokenRecord>> {
        self.store.list(username).await
    }

    /// Verify a signed token, whoever issued it.
    ///
    /// Self-issued tokens verify against our own public key; tokens from a
    /// trusted upstream issuer verify against a key fetched (and cached)
    /// from the issuer's JWKS.
    ///
    /// # Errors
    ///
    /// Returns the JWT error taxonomy ([`Error::InvalidToken`],
    /// [`Error::Expired`], [`Error::UntrustedIssuer`],
    /// [`Error::WrongAudience`]) plus [`Error::UpstreamUnavailable`] /
    /// [`Error::UnknownKey`] for JWKS failures.
    pub async fn verify(&self, encoded: &str) -> Result<TokenData> {
        let (header, unverified) = jwt::decode_unverified(encoded)?;

        let claims = if unverified.iss == self.config.issuer.url {
            jwt::verify(
                encoded,
                &self.decoding_key,
                &self.config.issuer.url,
                &self.config.own_audiences(),
            )?
        } else {
            let issuer = unverified.iss.clone();
            let trusted = self
                .config
                .trusted_issuers
                .get(&issuer)
                .ok_or(Error::UntrustedIssuer(unverified.iss))?;
            let kid = header
                .kid
                .ok_or_else(|| Error::InvalidToken("Token header has no kid".to_string()))?;
            let key = self.keys.get(&issuer, &kid).await?;
            jwt::verify(encoded, &key, &issuer, std::slice::from_ref(&trusted.audience))?
        };

        debug!(jti = %claims.jti, iss = %claims.iss, "Verified token");
        Ok(TokenData {
            claims,
            encoded: encoded.to_string(),
        })
    }

    /// Verify an upstream token and materialize it into a session token.
    ///
    /// The new session carries our signature, the default audience, and the
    /// identity's known scopes — internal tokens are never derived from an
    /// upstream signature directly.
    ///
    /// # Errors
    ///
    /// Verification errors as [`Self::verify`]; [`Error::InvalidRequest`] if
    /// the token is already self-issued.
    pub async fn verify_upstream(&self, encoded: &str, ip: Option<&str>) -> Result<Issued> {
        let data = self.verify(encoded).await?;
        if data.claims.iss == self.config.issuer.url {
            return Err(Error::InvalidRequest(
                "Token is already issued by this gateway".to_string(),
            ));
        }

        let user = UserInfo::from_claims(&data.claims, &self.config);
        let scopes: Vec<String> = self
            .effective_scopes(&data.claims)
            .into_iter()
            .filter(|s| self.config.is_known_scope(s))
            .collect();

        info!(username = %user.username, iss = %data.claims.iss, "Materializing upstream identity");
        self.create_session_token(&user, &scopes, ip).await
    }

    // ── Revocation ────────────────────────────────────────────────────────

    /// Revoke a token by handle. Idempotent; returns whether it existed.
    ///
    /// Revoking a session also revokes its derived children and drops their
    /// cache entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn revoke(&self, handle: &Handle, actor: &str, ip: Option<&str>) -> Result<bool> {
        let Some(record) = self.store.get(handle).await? else {
            return Ok(false);
        };
        self.delete_record(&record, actor, ip).await?;
        Ok(true)
    }

    /// Revoke a token by key, for owner-verified API paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn revoke_by_key(&self, key: &str, actor: &str, ip: Option<&str>) -> Result<bool> {
        let Some(record) = self.store.get_raw(key).await? else {
            return Ok(false);
        };
        self.delete_record(&record, actor, ip).await?;
        Ok(true)
    }

    async fn delete_record(
        &self,
        record: &TokenRecord,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        self.store.delete(&record.jti, &record.username).await?;
        audit::emit(&AuditEvent::revoked(&record.jti, actor, ip));

        if record.token_type == TokenType::Session {
            // Children die with the parent; their cache entries too.
            for child in self.store.list(&record.username).await? {
                if child.parent_jti.as_deref() == Some(record.jti.as_str()) {
                    self.store.delete(&child.jti, &child.username).await?;
                    self.cache.invalidate(&child_fingerprint(&child));
                    audit::emit(&AuditEvent::revoked(&child.jti, actor, ip));
                }
            }
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn issue(&self, params: IssueParams<'_>) -> Result<Issued> {
        let handle = Handle::generate();
        let issued_at = now();

        let mut extra = HashMap::new();
        extra.insert(
            self.config.username_claim().to_string(),
            serde_json::Value::from(params.user.username.clone()),
        );
        extra.insert(
            self.config.uid_claim().to_string(),
            serde_json::Value::from(params.user.uid),
        );

        let claims = Claims {
            iss: self.config.issuer.url.clone(),
            aud: Audience::from(params.audience),
            sub: params.user.username.clone(),
            iat: issued_at,
            exp: params.expires_at,
            jti: handle.key.clone(),
            email: params.user.email.clone(),
            groups: params.user.groups.clone(),
            scope: params.scopes.join(" "),
            extra,
        };
        let token = jwt::sign(&claims, &self.encoding_key, Some(self.config.issuer.kid.clone()))?;

        let record = TokenRecord {
            jti: handle.key.clone(),
            token_type: params.token_type,
            parent_jti: params.parent_jti,
            username: params.user.username.clone(),
            uid: params.user.uid,
            token_name: params.token_name,
            service: params.service,
            scopes: params.scopes.to_vec(),
            created_at: issued_at,
            expires_at: params.expires_at,
            token,
            secret_hash: handle.secret_hash(),
        };

        let ttl = Duration::from_secs(u64::try_from(params.expires_at - issued_at).unwrap_or(1));
        self.store.put(&record, ttl).await?;
        audit::emit(&AuditEvent::issued(&record, params.ip));

        Ok(Issued { handle, record })
    }

    /// The shared lookup-or-mint path for internal and notebook tokens.
    #[allow(clippy::too_many_arguments)]
    async fn derive(
        &self,
        parent: &TokenData,
        token_type: TokenType,
        scopes: &[String],
        audience: &str,
        service: Option<String>,
        fingerprint: &str,
        ip: Option<&str>,
    ) -> Result<Issued> {
        let current = now();
        let minimum = i64::try_from(MINIMUM_LIFETIME.as_secs()).unwrap_or(i64::MAX);
        let remaining = parent.remaining(current);
        if remaining < minimum {
            return Err(Error::InsufficientLifetime {
                remaining,
                minimum,
            });
        }

        let lock = self.cache.lock(fingerprint);
        let _guard = lock.lock().await;

        if let Some(issued) = self.resolve_cached(fingerprint).await? {
            debug!(jti = %issued.record.jti, fingerprint, "Derived token cache hit");
            return Ok(issued);
        }

        let user = UserInfo::from_claims(&parent.claims, &self.config);
        let issued = self
            .issue(IssueParams {
                user: &user,
                token_type,
                scopes,
                expires_at: parent.claims.exp,
                audience,
                parent_jti: Some(parent.claims.jti.clone()),
                service,
                token_name: None,
                ip,
            })
            .await?;

        let encoded_handle = issued.handle.encode(&self.config.token_prefix);
        let ttl = Duration::from_secs(u64::try_from(remaining).unwrap_or(1));
        self.store
            .put_mapping(fingerprint, &encoded_handle, ttl)
            .await?;
        self.cache.store(fingerprint, &encoded_handle);

        Ok(issued)
    }

    /// Resolve a fingerprint through the cache, then the store mapping.
    async fn resolve_cached(&self, fingerprint: &str) -> Result<Option<Issued>> {
        let cached = match self.cache.get(fingerprint) {
            Some(handle) => Some(handle),
            None => {
                let mapped = self.store.get_mapping(fingerprint).await?;
                if let Some(ref handle) = mapped {
                    self.cache.store(fingerprint, handle);
                }
                mapped
            }
        };
        let Some(encoded) = cached else {
            return Ok(None);
        };

        let Some(handle) = Handle::decode(&self.config.token_prefix, &encoded) else {
            self.cache.invalidate(fingerprint);
            return Ok(None);
        };
        match self.store.get(&handle).await? {
            Some(record) => Ok(Some(Issued { handle, record })),
            None => {
                // Record revoked or expired underneath the mapping.
                self.cache.invalidate(fingerprint);
                Ok(None)
            }
        }
    }

    fn require_known_scopes(&self, scopes: &[String]) -> Result<()> {
        for scope in scopes {
            if !self.config.is_known_scope(scope) {
                return Err(Error::Validation(format!("Unknown scope: {scope}")));
            }
        }
        Ok(())
    }

    /// The claim scopes plus every scope implied by group membership.
    fn effective_scopes(&self, claims: &Claims) -> BTreeSet<String> {
        let mut scopes: BTreeSet<String> = claims.scopes().into_iter().collect();
        for (scope, group) in &self.config.group_mapping {
            if claims.groups.iter().any(|g| &g.name == group) {
                scopes.insert(scope.clone());
            }
        }
        scopes
    }

    fn username_of(&self, claims: &Claims) -> String {
        claims.username(self.config.username_claim()).to_string()
    }
}

/// Reconstruct the dedup fingerprint of a derived token from its record.
fn child_fingerprint(record: &TokenRecord) -> String {
    let parent = record.parent_jti.as_deref().unwrap_or_default();
    match record.token_type {
        TokenType::Notebook => format!("{parent}:notebook"),
        _ => format!(
            "{parent}:{}:{}",
            record.service.as_deref().unwrap_or_default(),
            record.scopes.join(",")
        ),
    }
}

struct IssueParams<'a> {
    user: &'a UserInfo,
    token_type: TokenType,
    scopes: &'a [String],
    expires_at: i64,
    audience: &'a str,
    parent_jti: Option<String>,
    service: Option<String>,
    token_name: Option<String>,
    ip: Option<&'a str>,
}

fn sorted(scopes: &[String]) -> Vec<String> {
    let set: BTreeSet<&String> = scopes.iter().collect();
    set.into_iter().cloned().collect()
}
