//! Object store abstraction
//!
//! Defines the `ObjectStore` trait the remote tier is written against. A
//! backend adapter's only job beyond moving bytes is to sort its native errors
//! into "the object does not exist" and "something went wrong".

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Streaming body of a fetched object
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors reported by an object store backend
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// The key does not exist
    #[error("object not found: {key}")]
    NotFound {
        /// Requested key
        key: String,
    },

    /// Any other backend failure
    #[error("{}{message}", code.as_ref().map_or(String::new(), |c| format!("{c}: ")))]
    Backend {
        /// Backend error code, if the backend reported one
        code: Option<String>,
        /// Human-readable description
        message: String,
    },
}

impl ObjectStoreError {
    /// Create a backend error without an error code
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            code: None,
            message: message.into(),
        }
    }

    /// Returns true if the object does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Body of an upload
#[derive(Debug)]
pub enum ObjectBody {
    /// In-memory bytes
    Bytes(Bytes),
    /// An open file, read from its current position
    File(tokio::fs::File),
}

impl ObjectBody {
    /// A zero-length body
    #[must_use]
    pub fn empty() -> Self {
        Self::Bytes(Bytes::new())
    }

    /// Read the whole body into memory
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::File(mut file) => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<Bytes> for ObjectBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ObjectBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

/// A fetched object
pub struct StoredObject {
    /// Length reported by the backend
    pub content_length: u64,
    /// User metadata attached at upload time
    pub metadata: HashMap<String, String>,
    /// Object bytes
    pub body: ObjectReader,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("content_length", &self.content_length)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// A flat key/value blob store with per-object string metadata
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body` under `key`
    ///
    /// `content_length` is the declared size of the body.
    async fn put_object(
        &self,
        key: &str,
        body: ObjectBody,
        content_length: u64,
        metadata: HashMap<String, String>,
    ) -> Result<(), ObjectStoreError>;

    /// Fetch the object stored under `key`
    ///
    /// Must return [`ObjectStoreError::NotFound`] when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<StoredObject, ObjectStoreError>;
}
