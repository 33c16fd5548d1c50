use super::model::CacheEntry;
use super::Pool;
use anyhow::{Context, Result};
use tracing::instrument;

const OFFLINE_MODE_SETTING: &str = "offlineMode";

#[instrument(skip_all, fields(namespace = %namespace, key = %key))]
pub async fn get_entry(pool: &Pool, namespace: &str, key: &str) -> Result<Option<CacheEntry>> {
    let row = sqlx::query_as::<_, CacheEntry>(
        "SELECT key, value, updated_at FROM cache_entries WHERE namespace = ? AND key = ?",
    )
    .bind(namespace)
    .bind(key)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to read cache entry {namespace}/{key}"))?;
    Ok(row)
}

#[instrument(skip_all, fields(namespace = %namespace, key = %key))]
pub async fn put_entry(pool: &Pool, namespace: &str, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO cache_entries (namespace, key, value, updated_at) VALUES (?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(namespace)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to write cache entry {namespace}/{key}"))?;
    Ok(())
}

pub async fn list_entries(pool: &Pool, namespace: &str) -> Result<Vec<CacheEntry>> {
    let rows = sqlx::query_as::<_, CacheEntry>(
        "SELECT key, value, updated_at FROM cache_entries WHERE namespace = ? ORDER BY key",
    )
    .bind(namespace)
    .fetch_all(pool)
    .await
    .context("failed to list cache entries")?;
    Ok(rows)
}

/// Remove every cache entry and the session of a namespace in one transaction.
#[instrument(skip_all)]
pub async fn delete_namespace(pool: &Pool, namespace: &str) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let removed = sqlx::query("DELETE FROM cache_entries WHERE namespace = ?")
        .bind(namespace)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM sessions WHERE namespace = ?")
        .bind(namespace)
        .execute(&mut *tx)
        .await?;
    tx.commit().await.context("failed to clear namespace")?;
    Ok(removed)
}

pub async fn get_session_token(pool: &Pool, namespace: &str) -> Result<Option<String>> {
    let token = sqlx::query_scalar::<_, String>("SELECT token FROM sessions WHERE namespace = ?")
        .bind(namespace)
        .fetch_optional(pool)
        .await
        .context("failed to read session token")?;
    Ok(token)
}

pub async fn put_session_token(pool: &Pool, namespace: &str, token: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (namespace, token) VALUES (?, ?) \
         ON CONFLICT(namespace) DO UPDATE SET token = excluded.token, created_at = CURRENT_TIMESTAMP",
    )
    .bind(namespace)
    .bind(token)
    .execute(pool)
    .await
    .context("failed to persist session token")?;
    Ok(())
}

pub async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn put_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to persist setting {key}"))?;
    Ok(())
}

pub async fn get_offline_mode(pool: &Pool) -> Result<bool> {
    Ok(get_setting(pool, OFFLINE_MODE_SETTING)
        .await?
        .is_some_and(|v| v == "true"))
}

pub async fn put_offline_mode(pool: &Pool, offline: bool) -> Result<()> {
    put_setting(pool, OFFLINE_MODE_SETTING, if offline { "true" } else { "false" }).await
}
