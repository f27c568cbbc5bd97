//! Two-tier content-addressed cache
//!
//! This crate provides a build-output cache made of two tiers:
//! - An authoritative local disk tier ([`ContentStore`]) with atomic writes
//! - A remote object-store tier ([`RemoteMirror`]) filled asynchronously
//!
//! # Overview
//!
//! [`TieredCache`] ties them together. `put` writes to local disk and hands the
//! entry to a [`ReplicationPipeline`], a bounded queue drained by a fixed pool
//! of upload workers. `get` reads local disk and falls back to the remote tier,
//! copying remote hits to disk before returning them.
//!
//! The remote tier is reached through the [`ObjectStore`] trait. This crate
//! ships [`MemoryObjectStore`]; the S3 adapter lives in `strata-s3`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_cache::{MemoryObjectStore, TieredCache, TieredCacheConfig};
//!
//! # async fn run() -> strata_cache::Result<()> {
//! let config = TieredCacheConfig::new("/tmp/strata");
//! let cache = TieredCache::start(config, Arc::new(MemoryObjectStore::new())).await?;
//!
//! cache.put("action", "c0ffee", 5, &b"bytes"[..]).await?;
//! let hit = cache.get("action").await?;
//! assert!(hit.is_some());
//!
//! cache.close().await?;
//! eprintln!("{}", cache.summary());
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Every fallible operation returns the crate Error; variants are documented there"
)]

pub mod config;
pub mod disk;
mod error;
pub mod metrics;
pub mod pipeline;
pub mod remote;
pub mod tiered;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use config::TieredCacheConfig;
pub use disk::{CacheHit, ContentStore, IndexEntry, is_valid_output_id};
pub use metrics::{Counters, CountersSnapshot};
pub use pipeline::{PipelineStats, ReplicationPipeline, WorkItem};
pub use remote::{
    MemoryObjectStore, ObjectBody, ObjectReader, ObjectStore, ObjectStoreError, RemoteMirror,
    RemoteObject, StoredObject,
};
pub use tiered::TieredCache;
