//! Per-user keyed cache of JSON collections.
//!
//! The store never fails its callers: corrupt entries read as absent and
//! write failures are logged. Whatever the caller holds in memory stays
//! authoritative for the session.

use crate::db::{self, Pool};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: Pool,
    namespace: String,
}

impl LocalStore {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Same database, different user namespace.
    pub fn scoped(&self, namespace: impl Into<String>) -> Self {
        Self::new(self.pool.clone(), namespace)
    }

    /// Cached value for `key`, or `None` if absent, unreadable or corrupt.
    pub async fn get_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match db::get_entry(&self.pool, &self.namespace, key).await {
            Ok(entry) => entry?,
            Err(err) => {
                error!(?err, namespace = %self.namespace, key, "local store read failed");
                return None;
            }
        };
        match serde_json::from_str(&entry.value) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(?err, namespace = %self.namespace, key, "discarding corrupt cache entry");
                None
            }
        }
    }

    /// Serialize and overwrite `key`. Failures are logged, never returned.
    pub async fn set_data<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(err) = self.try_set_data(key, value).await {
            error!(?err, namespace = %self.namespace, key, "local store write failed");
        }
    }

    async fn try_set_data<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        db::put_entry(&self.pool, &self.namespace, key, &raw).await?;
        debug!(namespace = %self.namespace, key, bytes = raw.len(), "cached");
        Ok(())
    }

    /// Write an already-serialized value, used when restoring backups.
    pub(crate) async fn set_raw(&self, key: &str, raw: &str) -> Result<()> {
        db::put_entry(&self.pool, &self.namespace, key, raw).await
    }

    pub async fn keys(&self) -> Vec<String> {
        match db::list_entries(&self.pool, &self.namespace).await {
            Ok(entries) => entries.into_iter().map(|e| e.key).collect(),
            Err(err) => {
                error!(?err, namespace = %self.namespace, "failed to list cache keys");
                Vec::new()
            }
        }
    }

    /// Wipe every key and the session token of this namespace (logout).
    pub async fn clear_user_data(&self) {
        match db::delete_namespace(&self.pool, &self.namespace).await {
            Ok(removed) => debug!(namespace = %self.namespace, removed, "cleared user data"),
            Err(err) => error!(?err, namespace = %self.namespace, "failed to clear user data"),
        }
    }

    pub async fn session_token(&self) -> Option<String> {
        match db::get_session_token(&self.pool, &self.namespace).await {
            Ok(token) => token.filter(|t| !t.trim().is_empty()),
            Err(err) => {
                error!(?err, namespace = %self.namespace, "failed to read session token");
                None
            }
        }
    }

    pub async fn set_session_token(&self, token: &str) -> Result<()> {
        db::put_session_token(&self.pool, &self.namespace, token).await
    }

    /// Persisted offline-mode toggle. It is global, not per user.
    pub async fn offline_flag(&self) -> bool {
        db::get_offline_mode(&self.pool).await.unwrap_or_else(|err| {
            warn!(?err, "failed to read offline flag; assuming online");
            false
        })
    }

    pub async fn set_offline_flag(&self, offline: bool) -> Result<()> {
        db::put_offline_mode(&self.pool, offline).await
    }
}
