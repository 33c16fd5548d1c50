//! Database module: row models and SQL repositories behind the local store.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions over the cache, session and settings tables.
//!
//! Callers normally go through [`crate::store::LocalStore`]; this module only
//! owns the pool setup and the raw queries.

pub mod model;
pub mod repo;

pub use model::CacheEntry;
pub use repo::*;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true);
    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        // Every connection to `:memory:` is its own database; keep exactly one alive.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
    }
    let pool = pool_options
        .connect_with(options)
        .await
        .context("failed to open local store")?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("failed to run local store migrations")?;
    Ok(())
}
