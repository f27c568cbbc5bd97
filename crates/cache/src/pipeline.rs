//! Write-behind replication
//!
//! A bounded queue feeding a fixed pool of worker tasks. Each worker pulls a
//! [`WorkItem`], opens the blob it names and uploads it through the
//! [`RemoteMirror`]. Failures are logged and the item is dropped; nothing is
//! retried or requeued.
//!
//! Workers stop when the queue is closed and empty, or as soon as the
//! cancellation token fires. Anything still queued at cancellation is
//! dropped. Once shutdown returns, every item handed to
//! [`ReplicationPipeline::enqueue`] is counted as either replicated or
//! dropped.

use crate::remote::{ObjectBody, RemoteMirror};
use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A pending upload of one local entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Action the entry is indexed under
    pub action_id: String,
    /// Output ID of the blob
    pub output_id: String,
    /// Blob size in bytes
    pub size: u64,
    /// Location of the blob on local disk
    pub disk_path: PathBuf,
}

/// Replication totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Items handed to the pipeline, including ones dropped at the door
    pub enqueued: u64,
    /// Items uploaded successfully
    pub replicated: u64,
    /// Items abandoned (unreadable blob, failed upload or cancellation)
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    enqueued: AtomicU64,
    replicated: AtomicU64,
    dropped: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            replicated: self.replicated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Bounded queue plus worker pool pushing local writes to the remote tier
#[derive(Debug)]
pub struct ReplicationPipeline {
    sender: Mutex<Option<flume::Sender<WorkItem>>>,
    // Kept so items left behind by cancelled workers can be counted
    receiver: flume::Receiver<WorkItem>,
    workers: tokio::sync::Mutex<JoinSet<()>>,
    worker_count: usize,
    cancel: CancellationToken,
    stats: Arc<StatCounters>,
}

impl ReplicationPipeline {
    /// Start `workers` worker tasks reading from a queue of `queue_len` slots
    ///
    /// A `queue_len` of zero makes every enqueue wait for a free worker.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        mirror: Arc<RemoteMirror>,
        queue_len: usize,
        workers: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(Error::configuration(
                "replication needs at least one worker",
            ));
        }

        let (sender, receiver) = flume::bounded(queue_len);
        let stats = Arc::new(StatCounters::default());
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(run_worker(
                worker_id,
                receiver.clone(),
                Arc::clone(&mirror),
                cancel.clone(),
                Arc::clone(&stats),
            ));
        }
        tracing::debug!(workers, queue_len, "Started replication workers");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: tokio::sync::Mutex::new(set),
            worker_count: workers,
            cancel,
            stats,
        })
    }

    /// Queue `item` for upload, waiting while the queue is full
    ///
    /// After cancellation the item is logged and dropped instead, including
    /// when cancellation arrives while waiting for a free slot.
    pub async fn enqueue(&self, item: WorkItem) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)?;

        if self.cancel.is_cancelled() {
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            self.discard(&item.action_id, "Replication cancelled; dropping item");
            return Ok(());
        }

        let action_id = item.action_id.clone();
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            result = sender.send_async(item) => result.is_ok(),
        };
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if !sent {
            self.discard(&action_id, "Replication cancelled; dropping item");
        }
        Ok(())
    }

    fn discard(&self, action_id: &str, reason: &'static str) {
        tracing::warn!(action_id, "{reason}");
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the queue and wait for every worker to exit
    ///
    /// Without cancellation this drains the queue completely. Calling it
    /// twice returns [`Error::Closed`].
    pub async fn shutdown(&self) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::Closed)?;
        drop(sender);

        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Replication worker did not finish cleanly");
            }
        }

        // Only non-empty after cancellation. Waits for enqueues still
        // holding a sender, which return promptly once cancelled.
        while let Ok(item) = self.receiver.recv_async().await {
            self.discard(
                &item.action_id,
                "Dropping queued replication after cancellation",
            );
        }

        let stats = self.stats();
        tracing::debug!(
            enqueued = stats.enqueued,
            replicated = stats.replicated,
            dropped = stats.dropped,
            cancelled = self.cancel.is_cancelled(),
            "Replication pipeline stopped"
        );
        Ok(())
    }

    /// Whether [`ReplicationPipeline::shutdown`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of worker tasks
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Current totals
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: flume::Receiver<WorkItem>,
    mirror: Arc<RemoteMirror>,
    cancel: CancellationToken,
    stats: Arc<StatCounters>,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = receiver.recv_async() => match received {
                Ok(item) => item,
                Err(flume::RecvError::Disconnected) => {
                    tracing::debug!(worker_id, "Replication queue closed");
                    return;
                }
            },
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::warn!(
                    worker_id,
                    action_id = %item.action_id,
                    "Replication interrupted by cancellation"
                );
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                break;
            }
            () = replicate(&mirror, &item, &stats) => {}
        }
    }

    // Cancelled: whatever is still queued will never be uploaded
    while let Ok(item) = receiver.try_recv() {
        tracing::warn!(
            worker_id,
            action_id = %item.action_id,
            "Dropping queued replication after cancellation"
        );
        stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!(worker_id, "Replication worker cancelled");
}

async fn replicate(mirror: &RemoteMirror, item: &WorkItem, stats: &StatCounters) {
    let body = if item.size == 0 {
        ObjectBody::empty()
    } else {
        match tokio::fs::File::open(&item.disk_path).await {
            Ok(file) => ObjectBody::File(file),
            Err(e) => {
                tracing::error!(
                    action_id = %item.action_id,
                    path = %item.disk_path.display(),
                    error = %e,
                    "Failed to open blob for replication"
                );
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    };

    match mirror
        .put(&item.action_id, &item.output_id, item.size, body)
        .await
    {
        Ok(()) => {
            stats.replicated.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(
                action_id = %item.action_id,
                output_id = %item.output_id,
                error = %e,
                "Replication failed; dropping item"
            );
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
