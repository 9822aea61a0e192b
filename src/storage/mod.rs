//! Recording storage over a key-value backend

mod codec;
mod memory;
mod redis_store;

pub use codec::{decode_recording, encode_recording, RECORDING_MAGIC, RECORDING_VERSION};
pub use memory::{MemoryStore, StoreStats};
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::fingerprint::Fingerprint;
use crate::message::Response;
use crate::{GenproxyError, Result};

/// Key-value capability the recording store is built on.
///
/// Implementations must be safe to share between any number of in-flight
/// requests.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value; `Ok(None)` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value, replacing any previous one
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// One stored interaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// Request fingerprint
    pub key: Fingerprint,
    /// Upstream response
    pub response: Response,
    /// When the recording was captured
    pub stored_at: SystemTime,
}

impl Recording {
    /// Capture a response now
    #[must_use]
    pub fn new(key: Fingerprint, response: Response) -> Self {
        Self {
            key,
            response,
            stored_at: SystemTime::now(),
        }
    }
}

/// Recording store: key namespacing, timeouts and encoding over a [`KvStore`]
#[derive(Clone)]
pub struct RecordingStore {
    backend: Arc<dyn KvStore>,
    prefix: String,
    timeout: Duration,
    ttl: Option<Duration>,
}

impl RecordingStore {
    /// Create a store over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn KvStore>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            timeout,
            ttl: None,
        }
    }

    /// Create a store using the `[storage]` settings
    #[must_use]
    pub fn from_config(backend: Arc<dyn KvStore>, config: &StorageConfig) -> Self {
        Self::new(backend, config.key_prefix.clone(), config.timeout()).with_ttl(config.ttl())
    }

    /// Expire recordings after `ttl`
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Backend key for a fingerprint
    ///
    /// This is the only key construction; anything reading recordings
    /// directly from the backend must go through it.
    #[must_use]
    pub fn key_for(&self, fingerprint: &Fingerprint) -> String {
        format!("{}{}", self.prefix, fingerprint)
    }

    /// Look up the recording for a fingerprint
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend fails or times out, and
    /// `InvalidFormat` if the stored value cannot be decoded
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Recording>> {
        let key = self.key_for(fingerprint);
        let value = self.bounded("get", &key, self.backend.get(&key)).await?;

        match value {
            Some(bytes) => {
                let (response, stored_at) = decode_recording(&bytes)?;
                debug!("Loaded recording {} ({} bytes)", key, bytes.len());
                Ok(Some(Recording {
                    key: fingerprint.clone(),
                    response,
                    stored_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Store a recording, overwriting any previous one for the same fingerprint
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend fails or times out, and
    /// `DataTooLarge` if the response cannot be encoded
    pub async fn put(&self, recording: &Recording) -> Result<()> {
        let key = self.key_for(&recording.key);
        let value = encode_recording(&recording.response, recording.stored_at)?;
        let size = value.len();

        self.bounded("set", &key, self.backend.set(&key, value, self.ttl))
            .await?;
        debug!("Stored recording {} ({} bytes)", key, size);
        Ok(())
    }

    /// Remove the recording for a fingerprint
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backend fails or times out
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let key = self.key_for(fingerprint);
        self.bounded("delete", &key, self.backend.delete(&key)).await
    }

    async fn bounded<T>(
        &self,
        op: &str,
        key: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Storage {} timed out after {:?}: {}", op, self.timeout, key);
                Err(GenproxyError::StorageUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{fingerprint, FingerprintPolicy};
    use crate::message::Request;
    use http::header::{HeaderName, HeaderValue};
    use http::{Method, StatusCode};

    /// Backend that never answers
    struct StalledStore;

    #[async_trait]
    impl KvStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            std::future::pending().await
        }
    }

    fn test_fingerprint() -> Fingerprint {
        let request = Request::new(Method::GET, "http://example.com/a".parse().unwrap());
        fingerprint(&request, &FingerprintPolicy::default())
    }

    fn test_store(backend: Arc<dyn KvStore>) -> RecordingStore {
        RecordingStore::new(backend, "test:", Duration::from_millis(200))
    }

    #[test]
    fn test_key_for_uses_prefix() {
        let store = test_store(Arc::new(MemoryStore::new()));
        let fp = test_fingerprint();

        assert_eq!(store.key_for(&fp), format!("test:{}", fp.as_str()));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let backend = Arc::new(MemoryStore::new());
        let store = test_store(backend.clone());
        let response = Response::new(StatusCode::CREATED, "made").with_header(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain"),
        );
        let recording = Recording::new(test_fingerprint(), response.clone());

        store.put(&recording).await.unwrap();
        let loaded = store.get(&recording.key).await.unwrap().unwrap();

        assert_eq!(loaded.response, response);
        assert_eq!(loaded.key, recording.key);
        assert!(backend.contains(&store.key_for(&recording.key)));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = test_store(Arc::new(MemoryStore::new()));
        assert!(store.get(&test_fingerprint()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_last_write_wins() {
        let store = test_store(Arc::new(MemoryStore::new()));
        let fp = test_fingerprint();

        store
            .put(&Recording::new(fp.clone(), Response::new(StatusCode::OK, "first")))
            .await
            .unwrap();
        store
            .put(&Recording::new(fp.clone(), Response::new(StatusCode::OK, "second")))
            .await
            .unwrap();

        let loaded = store.get(&fp).await.unwrap().unwrap();
        assert_eq!(loaded.response.body, "second");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = test_store(Arc::new(MemoryStore::new()));
        let fp = test_fingerprint();
        store
            .put(&Recording::new(fp.clone(), Response::new(StatusCode::OK, "x")))
            .await
            .unwrap();

        assert!(store.delete(&fp).await.unwrap());
        assert!(!store.delete(&fp).await.unwrap());
        assert!(store.get(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let store = test_store(Arc::new(StalledStore));
        let fp = test_fingerprint();

        let err = store.get(&fp).await.unwrap_err();
        assert!(matches!(err, GenproxyError::StorageUnavailable(_)));

        let err = store
            .put(&Recording::new(fp, Response::new(StatusCode::OK, "")))
            .await
            .unwrap_err();
        assert!(matches!(err, GenproxyError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_invalid_format() {
        let backend = Arc::new(MemoryStore::new());
        let store = test_store(backend.clone());
        let fp = test_fingerprint();

        backend
            .set(&store.key_for(&fp), b"garbage".to_vec(), None)
            .await
            .unwrap();

        let err = store.get(&fp).await.unwrap_err();
        assert!(matches!(err, GenproxyError::InvalidFormat(_)));
    }
}
