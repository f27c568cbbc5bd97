//! Local disk tier
//!
//! A flat directory holding two kinds of files:
//! - `a-<action id>`: a small JSON index entry naming the output ID and size
//! - `o-<output id>`: the raw blob bytes
//!
//! Both are written through a temp file in the same directory followed by a
//! rename, so readers never observe a partial file. The two writes are not
//! transactional with each other; the index entry is what defines existence,
//! so an orphaned blob is harmless.

use crate::metrics::Counters;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Version written into every index entry
pub const INDEX_VERSION: u32 = 1;

/// Persisted index entry for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Format version
    #[serde(rename = "v")]
    pub version: u32,
    /// Hex output ID of the blob
    #[serde(rename = "o")]
    pub output_id: String,
    /// Blob size in bytes
    #[serde(rename = "n")]
    pub size: u64,
    /// Write time, nanoseconds since the Unix epoch
    #[serde(rename = "t")]
    pub time_nanos: i64,
}

/// A successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// Output ID recorded for the action
    pub output_id: String,
    /// Path of the blob on local disk
    pub disk_path: PathBuf,
}

/// The authoritative local tier
///
/// A `ContentStore` only exists once [`ContentStore::open`] has created its
/// directory. After [`ContentStore::close`] every operation returns
/// [`Error::Closed`].
#[derive(Debug)]
pub struct ContentStore {
    dir: PathBuf,
    closed: AtomicBool,
    counters: Counters,
}

impl ContentStore {
    /// Open (creating if needed) the store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        tracing::debug!(dir = %dir.display(), "Opened local cache");
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
            counters: Counters::new(),
        })
    }

    /// Root directory of the store
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Counters for this tier
    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Path of the index entry for `action_id`
    #[must_use]
    pub fn index_path(&self, action_id: &str) -> PathBuf {
        self.dir.join(format!("a-{action_id}"))
    }

    /// Path of the blob for `output_id`
    #[must_use]
    pub fn blob_path(&self, output_id: &str) -> PathBuf {
        self.dir.join(format!("o-{output_id}"))
    }

    /// Look up `action_id`
    ///
    /// A missing, malformed or non-hex index entry is a miss. Only an
    /// unexpected read failure is returned as an error.
    pub async fn get(&self, action_id: &str) -> Result<Option<CacheHit>> {
        self.ensure_open()?;
        self.counters.record_get();
        let started = Instant::now();

        let index_path = self.index_path(action_id);
        let raw = match tokio::fs::read(&index_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.counters.record_miss();
                return Ok(None);
            }
            Err(e) => {
                self.counters.record_get_error();
                return Err(Error::io(e, &index_path, "read"));
            }
        };

        let entry: IndexEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(
                    action_id,
                    path = %index_path.display(),
                    error = %e,
                    "Malformed index entry"
                );
                self.counters.record_get_error();
                return Ok(None);
            }
        };

        if !is_valid_output_id(&entry.output_id) {
            tracing::warn!(
                action_id,
                output_id = %entry.output_id,
                "Index entry has an invalid output id"
            );
            self.counters.record_get_error();
            return Ok(None);
        }

        self.counters.record_hit();
        self.counters
            .record_get_transfer(entry.size, started.elapsed());
        let disk_path = self.blob_path(&entry.output_id);
        Ok(Some(CacheHit {
            output_id: entry.output_id,
            disk_path,
        }))
    }

    /// Store `size` bytes read from `body` under `output_id` and index it
    /// under `action_id`
    ///
    /// Returns the blob path. A body that yields a different number of bytes
    /// than `size` fails with [`Error::SizeMismatch`] and leaves no blob. An
    /// output ID that [`get`](Self::get) would refuse fails with
    /// [`Error::InvalidOutputId`] before anything is written.
    pub async fn put<R>(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        body: R,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_open()?;
        self.counters.record_put();
        let started = Instant::now();

        match self.write_entry(action_id, output_id, size, body).await {
            Ok(path) => {
                self.counters.record_put_transfer(size, started.elapsed());
                tracing::debug!(action_id, output_id, size, "Stored local cache entry");
                Ok(path)
            }
            Err(e) => {
                self.counters.record_put_error();
                Err(e)
            }
        }
    }

    /// Stop the store
    ///
    /// Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        tracing::debug!(dir = %self.dir.display(), "Closed local cache");
        Ok(())
    }

    /// Whether [`ContentStore::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    async fn write_entry<R>(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        mut body: R,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !is_valid_output_id(output_id) {
            return Err(Error::InvalidOutputId {
                output_id: output_id.to_string(),
            });
        }
        let blob_path = self.blob_path(output_id);

        if size == 0 {
            tokio::fs::File::create(&blob_path)
                .await
                .map_err(|e| Error::io(e, &blob_path, "create"))?;
        } else {
            let (mut file, temp_path) = self.stage(&format!("o-{output_id}."))?;
            let written = tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(|e| Error::io(e, &temp_path, "write"))?;
            file.flush()
                .await
                .map_err(|e| Error::io(e, &temp_path, "flush"))?;
            drop(file);

            // Dropping the temp path removes the partial blob
            if written != size {
                return Err(Error::SizeMismatch {
                    path: blob_path.into(),
                    expected: size,
                    actual: written,
                });
            }
            commit(temp_path, &blob_path)?;
        }

        let entry = IndexEntry {
            version: INDEX_VERSION,
            output_id: output_id.to_string(),
            size,
            time_nanos: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| Error::serialization(format!("Failed to encode index entry: {e}")))?;

        let index_path = self.index_path(action_id);
        let (mut file, temp_path) = self.stage(&format!("a-{action_id}."))?;
        file.write_all(&json)
            .await
            .map_err(|e| Error::io(e, &temp_path, "write"))?;
        file.flush()
            .await
            .map_err(|e| Error::io(e, &temp_path, "flush"))?;
        drop(file);
        commit(temp_path, &index_path)?;

        Ok(blob_path)
    }

    /// Create a uniquely named temp file beside its final destination
    fn stage(&self, prefix: &str) -> Result<(tokio::fs::File, TempPath)> {
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.dir)
            .map_err(|e| Error::io(e, &self.dir, "create temp file"))?
            .into_parts();
        Ok((tokio::fs::File::from_std(file), temp_path))
    }
}

/// Whether `output_id` is usable as a blob name: non-empty, even-length hex
#[must_use]
pub fn is_valid_output_id(output_id: &str) -> bool {
    !output_id.is_empty() && hex::decode(output_id).is_ok()
}

fn commit(temp_path: TempPath, dest: &Path) -> Result<()> {
    temp_path
        .persist(dest)
        .map_err(|e| Error::io(e.error, dest, "rename"))
}
