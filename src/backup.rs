//! Portable JSON snapshot of everything cached for one user.

use crate::store::LocalStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    pub created_at: DateTime<Utc>,
}

/// `{ "meta": { "createdAt": .. }, "<cache key>": <value>, .. }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub meta: BackupMeta,
    #[serde(flatten)]
    pub entries: BTreeMap<String, Value>,
}

pub async fn collect(store: &LocalStore) -> Backup {
    let mut entries = BTreeMap::new();
    for key in store.keys().await {
        match store.get_data::<Value>(&key).await {
            Some(value) => {
                entries.insert(key, value);
            }
            None => warn!(key, "leaving unreadable entry out of backup"),
        }
    }
    Backup {
        meta: BackupMeta {
            created_at: Utc::now(),
        },
        entries,
    }
}

/// Write every non-null entry back into the store, overwriting what is there.
pub async fn restore(store: &LocalStore, backup: &Backup) -> Result<usize> {
    let mut restored = 0;
    for (key, value) in backup.entries.iter().filter(|(_, v)| !v.is_null()) {
        let raw = serde_json::to_string(value)?;
        store
            .set_raw(key, &raw)
            .await
            .with_context(|| format!("failed to restore {key}"))?;
        restored += 1;
    }
    info!(restored, created_at = %backup.meta.created_at, "backup restored");
    Ok(restored)
}

pub async fn write_file(path: &Path, backup: &Backup) -> Result<()> {
    let body = serde_json::to_string_pretty(backup)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("failed to write backup to {}", path.display()))?;
    Ok(())
}

pub async fn read_file(path: &Path) -> Result<Backup> {
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read backup {}", path.display()))?;
    let backup = serde_json::from_str(&body)
        .with_context(|| format!("{} is not a backup file", path.display()))?;
    Ok(backup)
}
