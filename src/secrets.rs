//! Webhook signing secret: where it comes from and how long we keep it.
//!
//! [`SecretStore`] abstracts the backing store (environment, control plane).
//! [`SecretCache`] memoizes the first successful fetch for the life of the
//! process; concurrent first callers share a single in-flight fetch, and a
//! failed fetch leaves the cache empty so the next caller retries.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),
    #[error("secret '{0}' is empty")]
    Empty(String),
    #[error("secret store request failed: {0}")]
    Store(String),
}

pub type SecretFuture<'a> = Pin<Box<dyn Future<Output = Result<String, SecretError>> + Send + 'a>>;

/// Backing store for named secrets.
pub trait SecretStore: Send + Sync {
    fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a>;
}

/// Reads secrets from environment variables; the secret name is the variable name.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
        Box::pin(async move {
            let value = std::env::var(name).map_err(|_| SecretError::NotFound(name.to_string()))?;
            if value.is_empty() {
                return Err(SecretError::Empty(name.to_string()));
            }
            Ok(value)
        })
    }
}

pub struct SecretCache {
    name: String,
    store: Arc<dyn SecretStore>,
    cached: OnceCell<String>,
}

impl SecretCache {
    pub fn new(name: impl Into<String>, store: Arc<dyn SecretStore>) -> Self {
        Self {
            name: name.into(),
            store,
            cached: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the secret, fetching it on first use.
    pub async fn get(&self) -> Result<&str, SecretError> {
        let value = self
            .cached
            .get_or_try_init(|| async {
                match self.store.get_secret(&self.name).await {
                    Ok(value) => {
                        info!(secret = %self.name, "webhook secret retrieved");
                        Ok(value)
                    }
                    Err(e) => {
                        error!(secret = %self.name, error = %e, "failed to retrieve webhook secret");
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` fetches, then returns `value`.
    struct CountingStore {
        calls: AtomicUsize,
        failures: usize,
        value: String,
        delay: Duration,
    }

    impl CountingStore {
        fn new(value: &str, failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                value: value.to_string(),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SecretStore for CountingStore {
        fn get_secret<'a>(&'a self, name: &'a str) -> SecretFuture<'a> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if call < self.failures {
                    return Err(SecretError::Store(format!("{name}: unavailable")));
                }
                Ok(self.value.clone())
            })
        }
    }

    #[tokio::test]
    async fn fetches_once_and_memoizes() {
        let store = Arc::new(CountingStore::new("s3cret", 0));
        let cache = SecretCache::new("webhook", store.clone());

        assert_eq!(cache.get().await.unwrap(), "s3cret");
        assert_eq!(cache.get().await.unwrap(), "s3cret");
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let store = Arc::new(CountingStore::new("s3cret", 1));
        let cache = SecretCache::new("webhook", store.clone());

        assert!(matches!(cache.get().await, Err(SecretError::Store(_))));
        assert_eq!(cache.get().await.unwrap(), "s3cret");
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_use_is_single_flight() {
        let mut store = CountingStore::new("s3cret", 0);
        store.delay = Duration::from_millis(20);
        let store = Arc::new(store);
        let cache = Arc::new(SecretCache::new("webhook", store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get().await.map(|s| s.to_string())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "s3cret");
        }
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn env_store_reads_variable() {
        std::env::set_var("BRANCHHOOK_TEST_SECRET_ENV", "from-env");
        let value = EnvSecretStore
            .get_secret("BRANCHHOOK_TEST_SECRET_ENV")
            .await
            .unwrap();
        assert_eq!(value, "from-env");
    }

    #[tokio::test]
    async fn env_store_missing_variable() {
        assert!(matches!(
            EnvSecretStore.get_secret("BRANCHHOOK_TEST_SECRET_UNSET").await,
            Err(SecretError::NotFound(_))
        ));
    }
}
