//! The tiered cache facade
//!
//! Reads go to local disk first and fall through to the remote tier, filling
//! the local tier on a remote hit. Writes land on local disk synchronously and
//! are replicated to the remote tier in the background.

use crate::config::TieredCacheConfig;
use crate::disk::{CacheHit, ContentStore};
use crate::metrics::Counters;
use crate::pipeline::{PipelineStats, ReplicationPipeline, WorkItem};
use crate::remote::{ObjectStore, RemoteMirror, RemoteObject};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Local disk cache with a write-behind remote mirror
///
/// Obtained from [`TieredCache::start`]; all operations take `&self` and may
/// run concurrently. After [`TieredCache::close`] every operation returns
/// [`Error::Closed`].
#[derive(Debug)]
pub struct TieredCache {
    config: TieredCacheConfig,
    disk: ContentStore,
    mirror: Arc<RemoteMirror>,
    pipeline: ReplicationPipeline,
    closed: AtomicBool,
}

impl TieredCache {
    /// Open the local tier, probe the remote tier and start replication
    pub async fn start(config: TieredCacheConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        Self::start_with_cancellation(config, store, CancellationToken::new()).await
    }

    /// Like [`TieredCache::start`], with workers tied to `cancel`
    ///
    /// Cancelling the token stops replication immediately, including during
    /// [`TieredCache::close`]; queued uploads are then dropped.
    pub async fn start_with_cancellation(
        config: TieredCacheConfig,
        store: Arc<dyn ObjectStore>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let disk = ContentStore::open(&config.local_dir).await?;
        let mirror = Arc::new(RemoteMirror::new(store, config.prefix.clone()));

        if let Err(e) = mirror.probe().await {
            tracing::error!(prefix = %config.prefix, error = %e, "Remote cache probe failed");
            if let Err(close_err) = disk.close() {
                tracing::debug!(error = %close_err, "Local cache already closed");
            }
            return Err(e);
        }

        let pipeline = ReplicationPipeline::spawn(
            Arc::clone(&mirror),
            config.queue_len,
            config.workers,
            cancel,
        )?;

        tracing::debug!(
            local_dir = %config.local_dir.display(),
            prefix = %config.prefix,
            queue_len = config.queue_len,
            workers = config.workers,
            "Tiered cache started"
        );

        Ok(Self {
            config,
            disk,
            mirror,
            pipeline,
            closed: AtomicBool::new(false),
        })
    }

    /// Look up `action_id`, local tier first
    ///
    /// A local failure is treated like a local miss. On a remote hit the
    /// blob is written to local disk and the local path is returned.
    #[tracing::instrument(name = "cache_get", skip(self))]
    pub async fn get(&self, action_id: &str) -> Result<Option<CacheHit>> {
        self.ensure_open()?;

        match self.disk.get(action_id).await {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Local lookup failed; trying remote");
            }
        }

        let Some(RemoteObject {
            output_id,
            size,
            body,
        }) = self.mirror.get(action_id).await?
        else {
            return Ok(None);
        };

        let disk_path = self.disk.put(action_id, &output_id, size, body).await?;
        tracing::debug!(output_id = %output_id, size, "Filled local cache from remote");
        Ok(Some(CacheHit {
            output_id,
            disk_path,
        }))
    }

    /// Store `size` bytes from `body` and queue them for replication
    ///
    /// Returns once the local write is durable; the remote upload happens
    /// later. May wait while the replication queue is full.
    ///
    /// [`Error::Closed`] means nothing was written. A put that is already
    /// writing when [`TieredCache::close`] runs still succeeds with its local
    /// path, but the entry is not replicated.
    #[tracing::instrument(name = "cache_put", skip(self, body))]
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

        let disk_path = match self.disk.put(action_id, output_id, size, body).await {
            Ok(path) => path,
            Err(Error::Closed) => return Err(Error::Closed),
            Err(e) => {
                return Err(Error::LocalPut {
                    source: Box::new(e),
                });
            }
        };

        let item = WorkItem {
            action_id: action_id.to_string(),
            output_id: output_id.to_string(),
            size,
            disk_path: disk_path.clone(),
        };
        match self.pipeline.enqueue(item).await {
            Ok(()) => {}
            Err(Error::Closed) => {
                tracing::warn!("Cache closed during put; entry stored locally but not replicated");
            }
            Err(e) => return Err(e),
        }

        Ok(disk_path)
    }

    /// Stop the local tier and wait for replication to finish
    ///
    /// Returns the first error encountered. Closing twice is an error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        let disk_result = self.disk.close();
        let pipeline_result = self.pipeline.shutdown().await;
        tracing::debug!("Tiered cache closed");
        disk_result.and(pipeline_result)
    }

    /// Settings the cache was started with
    #[must_use]
    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }

    /// Counters for the local tier
    #[must_use]
    pub fn disk_counters(&self) -> &Counters {
        self.disk.counters()
    }

    /// Counters for the remote tier, including the startup probe
    #[must_use]
    pub fn remote_counters(&self) -> &Counters {
        self.mirror.counters()
    }

    /// Replication totals
    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Per-tier summaries for an end-of-run report
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "disk stats:\n{}\nremote stats:\n{}",
            self.disk_counters().summary(),
            self.remote_counters().summary()
        )
    }

    /// Write the remote tier counters as CSV (with header) to `path`
    pub fn write_metrics_csv(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| Error::io(e, path, "create"))?;
        self.remote_counters()
            .write_csv(std::io::BufWriter::new(file), true)
            .map_err(|e| Error::io(e, path, "write"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryObjectStore;
    use tempfile::TempDir;

    async fn start(temp: &TempDir) -> (Arc<MemoryObjectStore>, TieredCache) {
        let store = Arc::new(MemoryObjectStore::new());
        let config = TieredCacheConfig::new(temp.path().join("cache")).with_queue_len(4);
        let cache = TieredCache::start(config, store.clone()).await.unwrap();
        (store, cache)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let config = TieredCacheConfig::new(temp.path()).with_workers(0);
        let err = TieredCache::start(config, Arc::new(MemoryObjectStore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_local_hit_skips_remote() {
        let temp = TempDir::new().unwrap();
        let (_store, cache) = start(&temp).await;
        cache.put("a1", "abcd", 3, &b"abc"[..]).await.unwrap();

        let remote_gets_before = cache.remote_counters().snapshot().gets;
        let hit = cache.get("a1").await.unwrap().unwrap();
        assert_eq!(hit.output_id, "abcd");
        assert_eq!(cache.remote_counters().snapshot().gets, remote_gets_before);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_hit_backfills_disk() {
        let temp = TempDir::new().unwrap();
        let (store, cache) = start(&temp).await;
        store.insert_raw(
            "go-cache/remote-only",
            b"remote bytes".to_vec(),
            std::collections::HashMap::from([("outputid".to_string(), "cafe".to_string())]),
        );

        let hit = cache.get("remote-only").await.unwrap().unwrap();
        assert_eq!(hit.output_id, "cafe");
        assert_eq!(std::fs::read(&hit.disk_path).unwrap(), b"remote bytes");

        // Now served locally
        let disk_hits = cache.disk_counters().snapshot().hits;
        cache.get("remote-only").await.unwrap().unwrap();
        assert_eq!(cache.disk_counters().snapshot().hits, disk_hits + 1);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_miss_on_both_tiers() {
        let temp = TempDir::new().unwrap();
        let (_store, cache) = start(&temp).await;
        assert!(cache.get("nothing").await.unwrap().is_none());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_returned() {
        let temp = TempDir::new().unwrap();
        let (store, cache) = start(&temp).await;
        store.set_fail_gets(true);
        let err = cache.get("nothing").await.unwrap_err();
        assert!(err.is_remote());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_put_failure_is_wrapped() {
        let temp = TempDir::new().unwrap();
        let (_store, cache) = start(&temp).await;
        let err = cache.put("a1", "01", 9, &b"short"[..]).await.unwrap_err();
        assert!(matches!(err, Error::LocalPut { .. }));
        assert!(err.to_string().starts_with("local cache put failed"));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_overlapping_close_keeps_local_write() {
        let temp = TempDir::new().unwrap();
        let (store, cache) = start(&temp).await;
        let cache = Arc::new(cache);

        // The body stays open until close has finished
        let (mut writer, reader) = tokio::io::duplex(64);
        let put = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.put("late", "abcd", 3, reader).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cache.close().await.unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"abc")
            .await
            .unwrap();
        drop(writer);

        let path = put.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        assert!(temp.path().join("cache/a-late").exists());
        assert!(store.object("go-cache/late").is_none());
        assert_eq!(cache.pipeline_stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_put_racing_close_never_reports_a_durable_write_as_failed() {
        for _ in 0..20 {
            let temp = TempDir::new().unwrap();
            let (_store, cache) = start(&temp).await;
            let cache = Arc::new(cache);

            let puts: Vec<_> = (0..8u8)
                .map(|i| {
                    let cache = Arc::clone(&cache);
                    tokio::spawn(async move {
                        let action_id = format!("race-{i}");
                        let result = cache.put(&action_id, &format!("{i:02x}"), 2, &b"hi"[..]).await;
                        (action_id, result)
                    })
                })
                .collect();
            tokio::task::yield_now().await;
            cache.close().await.unwrap();

            for put in puts {
                let (action_id, result) = put.await.unwrap();
                let indexed = temp.path().join(format!("cache/a-{action_id}")).exists();
                match result {
                    Ok(_) => assert!(indexed, "{action_id} succeeded without an index entry"),
                    Err(Error::Closed) => assert!(!indexed, "{action_id} was written but reported closed"),
                    Err(e) => panic!("unexpected error for {action_id}: {e}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let temp = TempDir::new().unwrap();
        let (_store, cache) = start(&temp).await;
        cache.close().await.unwrap();

        assert!(matches!(cache.close().await, Err(Error::Closed)));
        assert!(matches!(
            cache.put("a1", "01", 1, &b"x"[..]).await,
            Err(Error::Closed)
        ));
        assert!(matches!(cache.get("a1").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_summary_and_csv() {
        let temp = TempDir::new().unwrap();
        let (_store, cache) = start(&temp).await;
        cache.put("a1", "01", 1, &b"x"[..]).await.unwrap();
        cache.close().await.unwrap();

        let summary = cache.summary();
        assert!(summary.starts_with("disk stats:\n0 gets"));
        assert!(summary.contains("remote stats:\n1 gets: 1 hits"));

        let csv_path = temp.path().join("metrics.csv");
        cache.write_metrics_csv(&csv_path).unwrap();
        let csv = std::fs::read_to_string(csv_path).unwrap();
        assert!(csv.starts_with("gets,hits,misses,puts,"));
        // Probe put plus one replicated put
        assert!(csv.lines().nth(1).unwrap().starts_with("1,1,0,2,0,0,"));
    }
}
