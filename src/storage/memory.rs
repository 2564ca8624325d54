//! In-memory storage backend.
//!
//! Backed by `DashMap` with lazy expiry: expired entries are evicted when a
//! read touches them, so a record's TTL is enforced by its own `expires_at`
//! rather than a background timer. Suitable for single-node deployments and
//! the test suite.

use std::collections::BTreeSet;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{AdminHistoryEntry, AdminStore, TokenStore};
use crate::Result;
use crate::tokens::TokenRecord;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-memory token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: DashMap<String, TokenRecord>,
    user_index: DashMap<String, BTreeSet<String>>,
    /// fingerprint → (serialized handle, expires_at)
    mappings: DashMap<String, (String, i64)>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn evict(&self, jti: &str, username: &str) {
        self.tokens.remove(jti);
        if let Some(mut index) = self.user_index.get_mut(username) {
            index.remove(jti);
        }
        debug!(jti = %jti, "Lazy-evicted expired token record");
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, record: &TokenRecord, _ttl: Duration) -> Result<()> {
        self.user_index
            .entry(record.username.clone())
            .or_default()
            .insert(record.jti.clone());
        self.tokens.insert(record.jti.clone(), record.clone());
        Ok(())
    }

    async fn get_raw(&self, jti: &str) -> Result<Option<TokenRecord>> {
        let Some(entry) = self.tokens.get(jti) else {
            return Ok(None);
        };
        let record = entry.clone();
        drop(entry);

        if record.is_expired(now()) {
            self.evict(jti, &record.username);
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn list(&self, username: &str) -> Result<Vec<TokenRecord>> {
        let jtis: Vec<String> = self
            .user_index
            .get(username)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut records = Vec::new();
        for jti in jtis {
            if let Some(record) = self.get_raw(&jti).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete(&self, jti: &str, username: &str) -> Result<bool> {
        let existed = self.tokens.remove(jti).is_some();
        if let Some(mut index) = self.user_index.get_mut(username) {
            index.remove(jti);
        }
        Ok(existed)
    }

    async fn put_mapping(&self, fingerprint: &str, handle: &str, ttl: Duration) -> Result<()> {
        let expires_at = now() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.mappings
            .insert(fingerprint.to_string(), (handle.to_string(), expires_at));
        Ok(())
    }

    async fn get_mapping(&self, fingerprint: &str) -> Result<Option<String>> {
        let Some(entry) = self.mappings.get(fingerprint) else {
            return Ok(None);
        };
        let (handle, expires_at) = entry.clone();
        drop(entry);

        if now() >= expires_at {
            self.mappings.remove(fingerprint);
            return Ok(None);
        }
        Ok(Some(handle))
    }
}

#[derive(Default)]
struct AdminState {
    admins: BTreeSet<String>,
    history: Vec<AdminHistoryEntry>,
}

/// In-memory admin roster and history.
///
/// A single mutex guards both structures, which is what makes add/remove
/// transactional.
#[derive(Default)]
pub struct MemoryAdminStore {
    state: Mutex<AdminState>,
}

impl MemoryAdminStore {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AdminStore for MemoryAdminStore {
    async fn add(&self, entry: AdminHistoryEntry) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.admins.insert(entry.username.clone()) {
            return Ok(false);
        }
        state.history.push(entry);
        Ok(true)
    }

    async fn remove(&self, entry: AdminHistoryEntry) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.admins.remove(&entry.username) {
            return Ok(false);
        }
        state.history.push(entry);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().admins.iter().cloned().collect())
    }

    async fn is_admin(&self, username: &str) -> Result<bool> {
        Ok(self.state.lock().admins.contains(username))
    }

    async fn history(&self) -> Result<Vec<AdminHistoryEntry>> {
        Ok(self.state.lock().history.clone())
    }
}
