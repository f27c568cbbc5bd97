//! In-process object store
//!
//! Backs the remote tier with a `HashMap`. Useful for tests and for running
//! the cache without a real bucket. Failures and slow uploads can be injected
//! at runtime.

use super::store::{ObjectBody, ObjectStore, ObjectStoreError, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryObject {
    /// Object bytes
    pub data: Bytes,
    /// User metadata
    pub metadata: HashMap<String, String>,
}

/// An [`ObjectStore`] held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, MemoryObject>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    put_delay_ms: AtomicU64,
    put_calls: AtomicUsize,
}

impl MemoryObjectStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upload fail with a backend error
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every fetch fail with a backend error
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every upload
    pub fn set_put_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.put_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing the upload path
    pub fn insert_raw(
        &self,
        key: impl Into<String>,
        data: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) {
        self.objects().insert(
            key.into(),
            MemoryObject {
                data: data.into(),
                metadata,
            },
        );
    }

    /// Copy of the object under `key`
    #[must_use]
    pub fn object(&self, key: &str) -> Option<MemoryObject> {
        self.objects().get(key).cloned()
    }

    /// All stored keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of stored objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether the store holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Number of upload attempts, including failed ones
    #[must_use]
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, MemoryObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        content_length: u64,
        metadata: HashMap<String, String>,
    ) -> Result<(), ObjectStoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend {
                code: Some("InternalError".to_string()),
                message: format!("injected put failure for {key}"),
            });
        }

        let data = body
            .into_bytes()
            .await
            .map_err(|e| ObjectStoreError::backend(format!("reading body for {key}: {e}")))?;
        if data.len() as u64 != content_length {
            return Err(ObjectStoreError::Backend {
                code: Some("IncompleteBody".to_string()),
                message: format!(
                    "declared {content_length} bytes for {key}, body had {}",
                    data.len()
                ),
            });
        }

        self.insert_raw(key, data, metadata);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<StoredObject, ObjectStoreError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Backend {
                code: Some("InternalError".to_string()),
                message: format!("injected get failure for {key}"),
            });
        }

        let object = self.object(key).ok_or_else(|| ObjectStoreError::NotFound {
            key: key.to_string(),
        })?;
        Ok(StoredObject {
            content_length: object.data.len() as u64,
            metadata: object.metadata,
            body: Box::new(std::io::Cursor::new(object.data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryObjectStore::new();
        let metadata = HashMap::from([("outputid".to_string(), "ab".to_string())]);
        store
            .put_object("p/k", ObjectBody::from(b"data".to_vec()), 4, metadata.clone())
            .await
            .unwrap();

        let mut object = store.get_object("p/k").await.unwrap();
        assert_eq!(object.content_length, 4);
        assert_eq!(object.metadata, metadata);
        let mut buf = Vec::new();
        object.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"data");
        assert_eq!(store.len(), 1);
        assert_eq!(store.put_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get_object("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_length_mismatch_is_rejected() {
        let store = MemoryObjectStore::new();
        let err = store
            .put_object("k", ObjectBody::from(b"abc".to_vec()), 5, HashMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryObjectStore::new();
        store.set_fail_puts(true);
        assert!(
            store
                .put_object("k", ObjectBody::empty(), 0, HashMap::new())
                .await
                .is_err()
        );
        assert_eq!(store.put_calls(), 1);

        store.set_fail_puts(false);
        store
            .put_object("k", ObjectBody::empty(), 0, HashMap::new())
            .await
            .unwrap();

        store.set_fail_gets(true);
        let err = store.get_object("k").await.unwrap_err();
        assert!(!err.is_not_found());
    }
}
