use crate::store::LocalStore;
use async_trait::async_trait;

/// Where the remote client gets its bearer token. Consulted on every call,
/// never cached between calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer(&self) -> Option<String>;
}

/// A fixed token, used for share-link sessions and tests.
#[derive(Clone)]
pub struct StaticToken(pub String);

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken([REDACTED])")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer(&self) -> Option<String> {
        Some(self.0.clone()).filter(|t| !t.is_empty())
    }
}

#[async_trait]
impl TokenSource for LocalStore {
    async fn bearer(&self) -> Option<String> {
        self.session_token().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_token_is_read_on_every_call() {
        let pool = crate::db::init_pool("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = LocalStore::new(pool, "ana");
        assert_eq!(store.bearer().await, None);

        store.set_session_token("first").await.unwrap();
        assert_eq!(store.bearer().await.as_deref(), Some("first"));
        store.set_session_token("second").await.unwrap();
        assert_eq!(store.bearer().await.as_deref(), Some("second"));

        assert_eq!(StaticToken(String::new()).bearer().await, None);
        assert_eq!(format!("{:?}", StaticToken("secret".into())), "StaticToken([REDACTED])");
    }
}
