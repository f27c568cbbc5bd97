//! Queue backpressure between callers and replication workers

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_cache::{MemoryObjectStore, RemoteMirror, ReplicationPipeline, WorkItem};
use tokio_test::{assert_pending, assert_ready_ok, task};
use tokio_util::sync::CancellationToken;

fn empty_item(action_id: &str) -> WorkItem {
    WorkItem {
        action_id: action_id.to_string(),
        output_id: "00".to_string(),
        size: 0,
        disk_path: PathBuf::new(),
    }
}

#[tokio::test]
async fn rendezvous_queue_blocks_while_workers_are_busy() {
    let store = Arc::new(MemoryObjectStore::new());
    store.set_put_delay(Duration::from_millis(300));
    let mirror = Arc::new(RemoteMirror::new(store.clone(), "p"));
    let pipeline = ReplicationPipeline::spawn(mirror, 0, 1, CancellationToken::new()).unwrap();

    // Handed straight to the only worker, which then sits in a slow upload
    pipeline.enqueue(empty_item("first")).await.unwrap();

    let mut second = task::spawn(pipeline.enqueue(empty_item("second")));
    assert_pending!(second.poll());

    // Once the first upload finishes the worker takes the second item
    tokio::time::timeout(Duration::from_secs(5), async {
        while !second.is_woken() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never became free");
    assert_ready_ok!(second.poll());
    drop(second);

    pipeline.shutdown().await.unwrap();
    assert_eq!(store.keys(), vec!["p/first".to_string(), "p/second".to_string()]);
    assert_eq!(pipeline.stats().replicated, 2);
}

#[tokio::test]
async fn buffered_queue_accepts_up_to_capacity() {
    let store = Arc::new(MemoryObjectStore::new());
    store.set_put_delay(Duration::from_secs(60));
    let mirror = Arc::new(RemoteMirror::new(store.clone(), "p"));
    let cancel = CancellationToken::new();
    let pipeline = ReplicationPipeline::spawn(mirror, 2, 1, cancel.clone()).unwrap();

    // One item in flight with the worker, two buffered
    pipeline.enqueue(empty_item("a")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.put_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    pipeline.enqueue(empty_item("b")).await.unwrap();
    pipeline.enqueue(empty_item("c")).await.unwrap();

    let mut overflow = task::spawn(pipeline.enqueue(empty_item("d")));
    assert_pending!(overflow.poll());
    drop(overflow);

    cancel.cancel();
    pipeline.shutdown().await.unwrap();
    assert!(store.is_empty());
    // The abandoned overflow send is not counted at all
    let stats = pipeline.stats();
    assert_eq!((stats.enqueued, stats.dropped), (3, 3));
}
