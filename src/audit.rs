//! Audit logging for token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! an `audit` field, making the trail queryable in any log aggregator.
//! Events never contain handles or encoded tokens — only `jti`s and
//! metadata.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | Any token is minted (session, user, internal, notebook) |
//! | `token.revoked` | A token is explicitly revoked |

use serde::Serialize;

use crate::tokens::TokenRecord;

/// Structured audit event for a token lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// JTI of the affected token.
    pub jti: String,
    /// Owning username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Token type (for issuance events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
    /// Granted scopes (for issuance events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Consuming service (for internal tokens).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Parent token, for derived tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_jti: Option<String>,
    /// Who performed the action (for revocations).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Client IP, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl AuditEvent {
    /// Construct a `token.issued` event from a freshly stored record.
    #[must_use]
    pub fn issued(record: &TokenRecord, ip: Option<&str>) -> Self {
        Self {
            event: "token.issued",
            jti: record.jti.clone(),
            username: Some(record.username.clone()),
            token_type: Some(record.token_type.as_str()),
            scopes: Some(record.scopes.clone()),
            service: record.service.clone(),
            parent_jti: record.parent_jti.clone(),
            actor: None,
            ip: ip.map(str::to_string),
        }
    }

    /// Construct a `token.revoked` event.
    #[must_use]
    pub fn revoked(jti: &str, actor: &str, ip: Option<&str>) -> Self {
        Self {
            event: "token.revoked",
            jti: jti.to_string(),
            username: None,
            token_type: None,
            scopes: None,
            service: None,
            parent_jti: None,
            actor: Some(actor.to_string()),
            ip: ip.map(str::to_string),
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "token audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::TokenType;

    fn make_record() -> TokenRecord {
        TokenRecord {
            jti: "some-jti".to_string(),
            token_type: TokenType::Internal,
            parent_jti: Some("parent-jti".to_string()),
            username: "alice".to_string(),
            uid: 4510,
            token_name: None,
            service: Some("portal".to_string()),
            scopes: vec!["read:all".to_string()],
            created_at: 0,
            expires_at: 3600,
            token: "encoded".to_string(),
            secret_hash: "hash".to_string(),
        }
    }

    #[test]
    fn issued_event_carries_derivation_metadata() {
        let event = AuditEvent::issued(&make_record(), Some("10.0.0.1"));
        assert_eq!(event.event, "token.issued");
        assert_eq!(event.token_type, Some("internal"));
        assert_eq!(event.service.as_deref(), Some("portal"));
        assert_eq!(event.parent_jti.as_deref(), Some("parent-jti"));
    }

    #[test]
    fn issued_event_never_contains_the_token() {
        let event = AuditEvent::issued(&make_record(), None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("encoded"));
        assert!(!json.contains("hash"));
    }

    #[test]
    fn revoked_event_has_actor() {
        let event = AuditEvent::revoked("some-jti", "alice", None);
        assert_eq!(event.event, "token.revoked");
        assert_eq!(event.actor.as_deref(), Some("alice"));
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::revoked("jti", "actor", Some("127.0.0.1")));
    }
}
