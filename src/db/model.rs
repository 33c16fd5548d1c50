//! Row models returned by the repository queries.

use chrono::NaiveDateTime;

/// One cached collection of a namespace, still in its serialized form.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub updated_at: NaiveDateTime,
}
