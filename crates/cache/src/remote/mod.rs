//! Remote object-store tier
//!
//! [`RemoteMirror`] stores one object per action under `<prefix>/<action id>`
//! with the output ID carried in object metadata. Reads distinguish three
//! outcomes: a hit, a miss (the object does not exist) and an error.

mod memory;
mod store;

pub use memory::{MemoryObject, MemoryObjectStore};
pub use store::{ObjectBody, ObjectReader, ObjectStore, ObjectStoreError, StoredObject};

use crate::disk::is_valid_output_id;
use crate::metrics::Counters;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Metadata key holding the output ID of a remote object
pub const OUTPUT_ID_METADATA_KEY: &str = "outputid";

/// Action ID reserved for the startup probe
pub const PROBE_ACTION_ID: &str = "_probe";

/// A remote hit
pub struct RemoteObject {
    /// Output ID from the object metadata
    pub output_id: String,
    /// Length reported by the store
    pub size: u64,
    /// Object bytes
    pub body: ObjectReader,
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("output_id", &self.output_id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Read/write primitives over an [`ObjectStore`]
pub struct RemoteMirror {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    counters: Counters,
}

impl std::fmt::Debug for RemoteMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMirror")
            .field("prefix", &self.prefix)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl RemoteMirror {
    /// Create a mirror writing under `prefix`
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            counters: Counters::new(),
        }
    }

    /// Key prefix for every object
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Counters for this tier
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Object key for `action_id`
    #[must_use]
    pub fn object_key(&self, action_id: &str) -> String {
        format!("{}/{action_id}", self.prefix)
    }

    /// Upload `body` for `action_id`
    ///
    /// A zero `size` always sends an empty body. There is no retry.
    pub async fn put(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        body: ObjectBody,
    ) -> Result<()> {
        self.counters.record_put();
        let key = self.object_key(action_id);
        let body = if size == 0 { ObjectBody::empty() } else { body };
        let metadata = HashMap::from([(
            OUTPUT_ID_METADATA_KEY.to_string(),
            output_id.to_string(),
        )]);

        tracing::debug!(key = %key, output_id, size, "Remote put");
        let started = Instant::now();
        match self.store.put_object(&key, body, size, metadata).await {
            Ok(()) => {
                self.counters.record_put_transfer(size, started.elapsed());
                Ok(())
            }
            Err(e) => {
                self.counters.record_put_error();
                Err(Error::remote("put", key, e.to_string()))
            }
        }
    }

    /// Fetch the object for `action_id`
    ///
    /// `Ok(None)` means the object does not exist. An object without an
    /// output ID, or with one that is not hex, is an error rather than a miss.
    pub async fn get(&self, action_id: &str) -> Result<Option<RemoteObject>> {
        self.fetch(action_id, true).await
    }

    async fn fetch(&self, action_id: &str, require_hex: bool) -> Result<Option<RemoteObject>> {
        self.counters.record_get();
        let key = self.object_key(action_id);

        let started = Instant::now();
        let object = match self.store.get_object(&key).await {
            Ok(object) => object,
            Err(ObjectStoreError::NotFound { .. }) => {
                self.counters.record_miss();
                tracing::debug!(key = %key, "Remote miss");
                return Ok(None);
            }
            Err(e) => {
                self.counters.record_get_error();
                return Err(Error::remote("get", key, e.to_string()));
            }
        };
        let elapsed = started.elapsed();

        let Some(output_id) = object
            .metadata
            .get(OUTPUT_ID_METADATA_KEY)
            .filter(|id| !id.is_empty())
            .cloned()
        else {
            self.counters.record_get_error();
            return Err(Error::MissingOutputId { key });
        };
        if require_hex && !is_valid_output_id(&output_id) {
            tracing::warn!(
                key = %key,
                output_id = %output_id,
                "Remote object has an invalid output id"
            );
            self.counters.record_get_error();
            return Err(Error::InvalidOutputId { output_id });
        }

        self.counters.record_hit();
        self.counters
            .record_get_transfer(object.content_length, elapsed);
        tracing::debug!(
            key = %key,
            size = object.content_length,
            elapsed_ms = elapsed.as_millis(),
            "Remote hit"
        );

        Ok(Some(RemoteObject {
            output_id,
            size: object.content_length,
            body: object.body,
        }))
    }

    /// Write and read back a small object to prove the store is usable
    ///
    /// The probe object lives at `<prefix>/_probe` and holds its own key.
    pub async fn probe(&self) -> Result<()> {
        let key = self.object_key(PROBE_ACTION_ID);
        let payload = Bytes::from(key.clone());
        let size = payload.len() as u64;

        self.put(PROBE_ACTION_ID, &key, size, ObjectBody::Bytes(payload))
            .await
            .map_err(|e| Error::probe("put", e.to_string()))?;

        let object = match self.fetch(PROBE_ACTION_ID, false).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                return Err(Error::probe("get", format!("{key} not found after put")));
            }
            Err(e) => return Err(Error::probe("get", e.to_string())),
        };

        if object.size != size {
            return Err(Error::probe(
                "size",
                format!("expected {size} bytes at {key}, got {}", object.size),
            ));
        }

        let mut body = object.body;
        tokio::io::copy(&mut body, &mut tokio::io::sink())
            .await
            .map_err(|e| Error::probe("get", e.to_string()))?;

        tracing::debug!(key = %key, "Remote probe succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn mirror() -> (Arc<MemoryObjectStore>, RemoteMirror) {
        let store = Arc::new(MemoryObjectStore::new());
        let mirror = RemoteMirror::new(store.clone(), "go-cache");
        (store, mirror)
    }

    #[tokio::test]
    async fn test_put_sets_key_and_metadata() {
        let (store, mirror) = mirror();
        mirror
            .put("act", "beef", 3, ObjectBody::from(b"abc".to_vec()))
            .await
            .unwrap();

        let object = store.object("go-cache/act").unwrap();
        assert_eq!(object.data.as_ref(), b"abc");
        assert_eq!(object.metadata[OUTPUT_ID_METADATA_KEY], "beef");
        assert_eq!(mirror.counters().snapshot().put_bytes, 3);
    }

    #[tokio::test]
    async fn test_zero_size_sends_empty_body() {
        let (store, mirror) = mirror();
        // Body is ignored when the declared size is zero
        mirror
            .put("act", "00", 0, ObjectBody::from(b"ignored".to_vec()))
            .await
            .unwrap();
        assert!(store.object("go-cache/act").unwrap().data.is_empty());
    }

    #[tokio::test]
    async fn test_get_hit() {
        let (_store, mirror) = mirror();
        mirror
            .put("act", "beef", 4, ObjectBody::from(b"data".to_vec()))
            .await
            .unwrap();

        let mut object = mirror.get("act").await.unwrap().unwrap();
        assert_eq!(object.output_id, "beef");
        assert_eq!(object.size, 4);
        let mut buf = Vec::new();
        object.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"data");

        let snap = mirror.counters().snapshot();
        assert_eq!((snap.gets, snap.hits, snap.misses), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_get_miss_is_not_an_error() {
        let (_store, mirror) = mirror();
        assert!(mirror.get("unwritten").await.unwrap().is_none());

        let snap = mirror.counters().snapshot();
        assert_eq!((snap.gets, snap.misses, snap.get_errors), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_missing_output_id_is_error() {
        let (store, mirror) = mirror();
        store.insert_raw("go-cache/bare", b"xyz".to_vec(), HashMap::new());
        store.insert_raw(
            "go-cache/blank",
            b"xyz".to_vec(),
            HashMap::from([(OUTPUT_ID_METADATA_KEY.to_string(), String::new())]),
        );

        assert!(matches!(
            mirror.get("bare").await,
            Err(Error::MissingOutputId { .. })
        ));
        assert!(matches!(
            mirror.get("blank").await,
            Err(Error::MissingOutputId { .. })
        ));
        assert_eq!(mirror.counters().snapshot().get_errors, 2);
    }

    #[tokio::test]
    async fn test_non_hex_output_id_is_error() {
        let (store, mirror) = mirror();
        store.insert_raw(
            "go-cache/odd",
            b"xyz".to_vec(),
            HashMap::from([(OUTPUT_ID_METADATA_KEY.to_string(), "../o-zz".to_string())]),
        );

        let err = mirror.get("odd").await.unwrap_err();
        assert!(
            matches!(err, Error::InvalidOutputId { ref output_id } if output_id == "../o-zz")
        );
        let snap = mirror.counters().snapshot();
        assert_eq!((snap.gets, snap.hits, snap.get_errors), (1, 0, 1));
        assert_eq!(snap.get_bytes, 0);
    }

    #[tokio::test]
    async fn test_backend_errors_are_counted() {
        let (store, mirror) = mirror();
        store.set_fail_gets(true);
        store.set_fail_puts(true);

        let err = mirror.get("act").await.unwrap_err();
        assert!(matches!(err, Error::Remote { operation: "get", .. }));
        let err = mirror
            .put("act", "01", 1, ObjectBody::from(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote { operation: "put", .. }));

        let snap = mirror.counters().snapshot();
        assert_eq!(snap.get_errors, 1);
        assert_eq!(snap.put_errors, 1);
    }

    #[tokio::test]
    async fn test_probe_writes_own_key() {
        let (store, mirror) = mirror();
        mirror.probe().await.unwrap();

        let object = store.object("go-cache/_probe").unwrap();
        assert_eq!(object.data.as_ref(), b"go-cache/_probe");
        assert_eq!(object.metadata[OUTPUT_ID_METADATA_KEY], "go-cache/_probe");
    }

    #[tokio::test]
    async fn test_probe_reports_failed_stage() {
        let (store, mirror) = mirror();
        store.set_fail_puts(true);
        assert!(matches!(
            mirror.probe().await,
            Err(Error::Probe { stage: "put", .. })
        ));

        store.set_fail_puts(false);
        store.set_fail_gets(true);
        assert!(matches!(
            mirror.probe().await,
            Err(Error::Probe { stage: "get", .. })
        ));
    }
}
