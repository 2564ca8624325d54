//! Storage abstractions.
//!
//! Two backends implement the same traits: an in-memory store (DashMap,
//! the default — and what the test suite runs against) and Redis (the
//! expected production backend, selected by setting `redis_url`).
//!
//! Key layout, shared by both backends:
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `token:{jti}` | JSON [`TokenRecord`] | token TTL |
//! | `tokens-for-user:{username}` | set of `jti` | max of members |
//! | `internal-token:{parent}:{service}:{scopes}` | serialized handle | derived TTL |
//! | `admins` | set of usernames | none |
//! | `admin-history` | append-only list of JSON entries | none |

mod memory;
mod redis;

pub use self::memory::{MemoryAdminStore, MemoryTokenStore};
pub use self::redis::{RedisAdminStore, RedisTokenStore};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::handle::Handle;
use crate::tokens::TokenRecord;

/// Persistence for token records and the internal-token dedup mapping.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Idempotent upsert keyed by `jti`; also updates the per-user index.
    async fn put(&self, record: &TokenRecord, ttl: Duration) -> Result<()>;

    /// Fetch a record by `jti` alone. Expired records are never returned.
    async fn get_raw(&self, jti: &str) -> Result<Option<TokenRecord>>;

    /// All active (unexpired) records for a user.
    async fn list(&self, username: &str) -> Result<Vec<TokenRecord>>;

    /// Delete a record and its index entry. Idempotent; returns whether the
    /// record existed.
    async fn delete(&self, jti: &str, username: &str) -> Result<bool>;

    /// Record the derived-token mapping for a fingerprint.
    async fn put_mapping(&self, fingerprint: &str, handle: &str, ttl: Duration) -> Result<()>;

    /// Look up the derived-token mapping for a fingerprint.
    async fn get_mapping(&self, fingerprint: &str) -> Result<Option<String>>;

    /// Resolve a full handle: fetch by key, then verify the secret digest in
    /// constant time. Unknown keys and secret mismatches are both `None` —
    /// the caller cannot distinguish them, and must not be able to.
    async fn get(&self, handle: &Handle) -> Result<Option<TokenRecord>> {
        match self.get_raw(&handle.key).await? {
            Some(record) if handle.secret_matches(&record.secret_hash) => Ok(Some(record)),
            _ => Ok(None),
        }
    }
}

/// What happened to the admin roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    /// Username was added to the roster.
    Add,
    /// Username was removed from the roster.
    Remove,
}

/// One append-only history entry for an admin roster change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminHistoryEntry {
    /// Username whose roster membership changed.
    pub username: String,
    /// Add or remove.
    pub action: AdminAction,
    /// Who made the change (`<bootstrap>` for config-seeded entries).
    pub actor: String,
    /// Client IP of the actor, when known.
    pub ip: Option<String>,
    /// When the change happened (UTC).
    pub event_time: DateTime<Utc>,
}

/// Persistence for the administrator roster and its change history.
///
/// `add` and `remove` are transactional: the roster mutation and its history
/// entry land together or not at all, and a no-op mutation (already present,
/// already absent) writes no history.
#[async_trait::async_trait]
pub trait AdminStore: Send + Sync + 'static {
    /// Add `entry.username` to the roster. Returns whether anything changed.
    async fn add(&self, entry: AdminHistoryEntry) -> Result<bool>;

    /// Remove `entry.username` from the roster. Returns whether anything
    /// changed.
    async fn remove(&self, entry: AdminHistoryEntry) -> Result<bool>;

    /// Current roster, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Set-membership check.
    async fn is_admin(&self, username: &str) -> Result<bool>;

    /// The full change history, oldest first.
    async fn history(&self) -> Result<Vec<AdminHistoryEntry>>;
}
