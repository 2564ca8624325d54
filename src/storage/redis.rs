//! Redis storage backend.
//!
//! Uses a multiplexed [`ConnectionManager`] (cheap to clone, reconnects
//! internally) so request handlers never share a mutable connection. Token
//! TTLs are delegated to Redis key expiry; the per-user index set keeps the
//! largest TTL among its members and may briefly hold stale `jti`s, which
//! `list` filters and prunes.
//!
//! Admin roster mutations run as Lua scripts so the set update and the
//! history append are atomic — a no-op mutation writes no history.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{AdminHistoryEntry, AdminStore, TokenStore};
use crate::tokens::TokenRecord;
use crate::{Error, Result};

fn storage_err(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

fn token_key(jti: &str) -> String {
    format!("token:{jti}")
}

fn user_key(username: &str) -> String {
    format!("tokens-for-user:{username}")
}

fn mapping_key(fingerprint: &str) -> String {
    format!("internal-token:{fingerprint}")
}

const ADMINS_KEY: &str = "admins";
const HISTORY_KEY: &str = "admin-history";

/// Redis-backed token store.
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl RedisTokenStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = ConnectionManager::new(client).await.map_err(storage_err)?;
        Ok(Self { conn })
    }

    /// Build from an existing connection manager (shared with other stores).
    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl TokenStore for RedisTokenStore {
    async fn put(&self, record: &TokenRecord, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(token_key(&record.jti), json, ttl_secs)
            .ignore()
            .sadd(user_key(&record.username), &record.jti)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_err)?;

        // Keep the index alive at least as long as its longest-lived member.
        let index = user_key(&record.username);
        let current: i64 = conn.ttl(&index).await.map_err(storage_err)?;
        if current < i64::try_from(ttl_secs).unwrap_or(i64::MAX) {
            let _: bool = conn
                .expire(&index, i64::try_from(ttl_secs).unwrap_or(i64::MAX))
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn get_raw(&self, jti: &str) -> Result<Option<TokenRecord>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(token_key(jti)).await.map_err(storage_err)?;
        let Some(value) = value else {
            return Ok(None);
        };
        let record: TokenRecord = serde_json::from_str(&value)?;
        if record.is_expired(chrono::Utc::now().timestamp()) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn list(&self, username: &str) -> Result<Vec<TokenRecord>> {
        let mut conn = self.conn.clone();
        let jtis: Vec<String> = conn
            .smembers(user_key(username))
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        let mut stale = Vec::new();
        for jti in jtis {
            match self.get_raw(&jti).await? {
                Some(record) => records.push(record),
                None => stale.push(jti),
            }
        }
        if !stale.is_empty() {
            let _: i64 = conn
                .srem(user_key(username), stale)
                .await
                .map_err(storage_err)?;
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete(&self, jti: &str, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(token_key(jti))
            .srem(user_key(username), jti)
            .ignore();
        let (deleted,): (i64,) = pipe.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn put_mapping(&self, fingerprint: &str, handle: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(mapping_key(fingerprint), handle, ttl.as_secs().max(1))
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_mapping(&self, fingerprint: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(mapping_key(fingerprint))
            .await
            .map_err(storage_err)
    }
}

/// `SADD` + history append, atomically, only when the member was new.
const ADD_SCRIPT: &str = r"
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[2])
  return 1
end
return 0
";

/// `SREM` + history append, atomically, only when the member existed.
const REMOVE_SCRIPT: &str = r"
if redis.call('SREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[2], ARGV[2])
  return 1
end
return 0
";

/// Redis-backed admin roster and history.
pub struct RedisAdminStore {
    conn: ConnectionManager,
    add_script: redis::Script,
    remove_script: redis::Script,
}

impl RedisAdminStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = ConnectionManager::new(client).await.map_err(storage_err)?;
        Ok(Self::with_connection(conn))
    }

    /// Build from an existing connection manager.
    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            add_script: redis::Script::new(ADD_SCRIPT),
            remove_script: redis::Script::new(REMOVE_SCRIPT),
        }
    }

    async fn run_roster_script(
        &self,
        script: &redis::Script,
        entry: &AdminHistoryEntry,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(entry)?;
        let changed: i64 = script
            .key(ADMINS_KEY)
            .key(HISTORY_KEY)
            .arg(&entry.username)
            .arg(json)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(changed == 1)
    }
}

#[async_trait::async_trait]
impl AdminStore for RedisAdminStore {
    async fn add(&self, entry: AdminHistoryEntry) -> Result<bool> {
        self.run_roster_script(&self.add_script, &entry).await
    }

    async fn remove(&self, entry: AdminHistoryEntry) -> Result<bool> {
        self.run_roster_script(&self.remove_script, &entry).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut admins: Vec<String> = conn.smembers(ADMINS_KEY).await.map_err(storage_err)?;
        admins.sort();
        Ok(admins)
    }

    async fn is_admin(&self, username: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(ADMINS_KEY, username)
            .await
            .map_err(storage_err)
    }

    async fn history(&self) -> Result<Vec<AdminHistoryEntry>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .lrange(HISTORY_KEY, 0, -1)
            .await
            .map_err(storage_err)?;
        entries
            .iter()
            .map(|e| serde_json::from_str(e).map_err(Into::into))
            .collect()
    }
}
