/*!
Opt-in retrying decorator for storage backends.

The engine surfaces backend failures to its caller untouched. Configuring
`StorageConfig::retry` (or wrapping a backend by hand) puts every backend
call behind a [`RetryPolicy`].
*/

use async_trait::async_trait;
use savestore_retry::{retry, RetryError, RetryPolicy, RetryableError};
use serde_json::Value;

use super::StorageBackend;
use crate::{DataError, Result};

/// Only backend and filesystem failures are worth another attempt; bad keys
/// and corrupt records fail the same way every time
impl RetryableError for DataError {
    fn is_transient(&self) -> bool {
        matches!(self.root(), DataError::Storage { .. } | DataError::Io(_))
    }
}

/// Storage backend decorator retrying transient failures with backoff
pub struct RetryingStorage<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: StorageBackend> RetryingStorage<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            policy: RetryPolicy::local_storage(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

fn give_up(operation: &'static str, key: &str, err: RetryError<DataError>) -> DataError {
    match err {
        RetryError::Permanent { error, .. } => error,
        RetryError::Exhausted { attempts, last, .. } => {
            DataError::storage(operation, key, format!("gave up after {attempts} attempts: {last}"))
        }
    }
}

#[async_trait]
impl<B: StorageBackend> StorageBackend for RetryingStorage<B> {
    async fn save(&self, key: &str, value: &Value) -> Result<()> {
        retry("save", &self.policy, |_| self.inner.save(key, value))
            .await
            .map_err(|e| give_up("save", key, e))
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        retry("load", &self.policy, |_| self.inner.load(key))
            .await
            .map_err(|e| give_up("load", key, e))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        retry("remove", &self.policy, |_| self.inner.remove(key))
            .await
            .map_err(|e| give_up("remove", key, e))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        retry("keys", &self.policy, |_| self.inner.keys(prefix))
            .await
            .map_err(|e| give_up("keys", prefix, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` saves, then delegates to memory
    struct FlakyStorage {
        failures: usize,
        attempts: AtomicUsize,
        inner: MemoryStorage,
    }

    #[async_trait]
    impl StorageBackend for FlakyStorage {
        async fn save(&self, key: &str, value: &Value) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(DataError::storage("save", key, "backend busy"));
            }
            self.inner.save(key, value).await
        }

        async fn load(&self, key: &str) -> Result<Option<Value>> {
            self.inner.load(key).await
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Err(DataError::InvalidDataType("not removable".to_string()))
        }
    }

    fn flaky(failures: usize, max_attempts: usize) -> RetryingStorage<FlakyStorage> {
        RetryingStorage::new(FlakyStorage {
            failures,
            attempts: AtomicUsize::new(0),
            inner: MemoryStorage::new(),
        })
        .with_policy(RetryPolicy::local_storage().with_max_attempts(max_attempts))
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let storage = flaky(2, 5);

        storage.save("bubblePop_settings", &json!({"volume": 1})).await.unwrap();
        assert_eq!(storage.inner().attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            storage.load("bubblePop_settings").await.unwrap(),
            Some(json!({"volume": 1}))
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_attempt_limit() {
        let storage = flaky(10, 2);

        let err = storage.save("bubblePop_settings", &json!({})).await.unwrap_err();
        assert!(err.to_string().contains("gave up after 2 attempts"));
        assert_eq!(storage.inner().attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let storage = flaky(0, 5);

        let err = storage.remove("bubblePop_settings").await.unwrap_err();
        assert!(matches!(err, DataError::InvalidDataType(_)));
    }

    #[test]
    fn test_tagged_storage_errors_stay_transient() {
        let err = DataError::storage("save", "k", "busy").tagged(crate::OperationTag::Save, "settings");
        assert!(err.is_transient());
        assert!(!DataError::validation("bad").is_transient());
    }
}
