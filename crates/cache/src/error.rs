//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error on the local disk tier
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(strata::cache::io),
        help("Check file permissions and free space in the local cache directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// The body did not contain the declared number of bytes
    #[error("wrote {actual} bytes to {}, expected {expected}", path.display())]
    #[diagnostic(code(strata::cache::size_mismatch))]
    SizeMismatch {
        /// Blob the body was written for
        path: Box<Path>,
        /// Declared size
        expected: u64,
        /// Bytes actually read from the body
        actual: u64,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(strata::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(strata::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Remote transport or protocol failure
    #[error("remote {operation} failed for {key}: {message}")]
    #[diagnostic(
        code(strata::cache::remote),
        help("Check connectivity and credentials for the remote object store")
    )]
    Remote {
        /// Operation that failed ("get" or "put")
        operation: &'static str,
        /// Object key
        key: String,
        /// Backend error message
        message: String,
    },

    /// Remote object exists but carries no output ID
    #[error("remote object {key} has no output id metadata")]
    #[diagnostic(
        code(strata::cache::missing_output_id),
        help("The object was not written by this cache; content without an output ID is unusable")
    )]
    MissingOutputId {
        /// Object key
        key: String,
    },

    /// Output ID that is not a non-empty hex string
    #[error("output id {output_id:?} is not a hex string")]
    #[diagnostic(
        code(strata::cache::invalid_output_id),
        help("Output IDs name blobs on disk and must be non-empty lowercase or uppercase hex")
    )]
    InvalidOutputId {
        /// The rejected output ID
        output_id: String,
    },

    /// Startup self-test against the remote tier failed
    #[error("remote cache probe {stage} failed: {message}")]
    #[diagnostic(
        code(strata::cache::probe),
        help("The remote tier must be reachable and writable before the cache starts")
    )]
    Probe {
        /// Probe step that failed ("put", "get" or "size")
        stage: &'static str,
        /// What went wrong
        message: String,
    },

    /// Operation on a cache that has already been closed
    #[error("cache is closed")]
    #[diagnostic(code(strata::cache::closed))]
    Closed,

    /// The local write on the tiered put path failed
    #[error("local cache put failed: {source}")]
    #[diagnostic(code(strata::cache::local_put))]
    LocalPut {
        /// The disk tier error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a remote failure error
    #[must_use]
    pub fn remote(
        operation: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            operation,
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a probe failure error
    #[must_use]
    pub fn probe(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Probe {
            stage,
            message: message.into(),
        }
    }

    /// Returns true if this error came from the remote tier
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::MissingOutputId { .. })
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
