//! Administrator roster management.
//!
//! Thin service over [`AdminStore`]: validates usernames, stamps history
//! entries, and seeds the initial roster from configuration at startup.
//! Every mutation is transactional with its history entry — the store
//! guarantees both land or neither does.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::config::is_valid_username;
use crate::storage::{AdminAction, AdminHistoryEntry, AdminStore};
use crate::{Error, Result};

/// Actor recorded for config-seeded roster entries.
const BOOTSTRAP_ACTOR: &str = "<bootstrap>";

/// The administrator roster service.
pub struct AdminService {
    store: Arc<dyn AdminStore>,
}

impl AdminService {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn AdminStore>) -> Self {
        Self { store }
    }

    /// Seed the roster from configuration. Idempotent: usernames already on
    /// the roster are skipped without history entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn seed(&self, admins: &[String]) -> Result<()> {
        for username in admins {
            let added = self
                .store
                .add(self.entry(username, AdminAction::Add, BOOTSTRAP_ACTOR, None))
                .await?;
            if added {
                info!(username = %username, "Seeded administrator from config");
            }
        }
        Ok(())
    }

    /// Add an administrator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed usernames and
    /// [`Error::Storage`] for store failures.
    pub async fn add(&self, username: &str, actor: &str, ip: Option<&str>) -> Result<bool> {
        if !is_valid_username(username) {
            return Err(Error::Validation(format!("Invalid username: {username}")));
        }
        self.store
            .add(self.entry(username, AdminAction::Add, actor, ip))
            .await
    }

    /// Remove an administrator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn remove(&self, username: &str, actor: &str, ip: Option<&str>) -> Result<bool> {
        self.store
            .remove(self.entry(username, AdminAction::Remove, actor, ip))
            .await
    }

    /// Current roster, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Whether the user is on the roster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn is_admin(&self, username: &str) -> Result<bool> {
        self.store.is_admin(username).await
    }

    /// The full change history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for store failures.
    pub async fn history(&self) -> Result<Vec<AdminHistoryEntry>> {
        self.store.history().await
    }

    fn entry(
        &self,
        username: &str,
        action: AdminAction,
        actor: &str,
        ip: Option<&str>,
    ) -> AdminHistoryEntry {
        AdminHistoryEntry {
            username: username.to_string(),
            action,
            actor: actor.to_string(),
            ip: ip.map(str::to_string),
            event_time: Utc::now(),
        }
    }
}
