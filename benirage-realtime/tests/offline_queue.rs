//! Offline queue persistence and replay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use benirage_realtime::{
    drain_on_connect, ConnectionConfig, ConnectionManager, ConnectionState, MemoryQueueStore,
    OfflineQueue, QueuePolicy, RocksQueueStore, StoreConfig, SyncStatus,
};
use common::{FakeBackend, RecordingWriter};
use serde_json::json;
use tempfile::TempDir;

fn open_rocks(dir: &TempDir, policy: QueuePolicy) -> OfflineQueue<RocksQueueStore> {
    let store = RocksQueueStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    OfflineQueue::open(store, policy).unwrap()
}

#[test]
fn test_pending_write_survives_restart() {
    let dir = TempDir::new().unwrap();
    let id = {
        let queue = open_rocks(&dir, QueuePolicy::chat());
        queue
            .enqueue("messages", json!({"room_id": 7, "body": "are you there?"}))
            .unwrap()
    };

    let queue = open_rocks(&dir, QueuePolicy::chat());
    let pending = queue.pending("messages");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].payload["body"], "are you there?");
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(queue.total_len(), 1);
}

#[tokio::test]
async fn test_retry_count_survives_restart() {
    let dir = TempDir::new().unwrap();
    let writer = RecordingWriter::new();
    writer.set_failing(true);
    {
        let queue = open_rocks(&dir, QueuePolicy::chat());
        queue.enqueue("donations", json!({"amount": 25})).unwrap();
        let report = queue.drain(writer.as_ref()).await.unwrap();
        assert_eq!(report.retained, 1);
    }

    let queue = open_rocks(&dir, QueuePolicy::chat());
    assert_eq!(queue.pending("donations")[0].retry_count, 1);

    // Two more failures reach the cap of three
    queue.drain(writer.as_ref()).await.unwrap();
    let report = queue.drain(writer.as_ref()).await.unwrap();
    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].retry_count, 3);
    drop(queue);

    let queue = open_rocks(&dir, QueuePolicy::chat());
    assert!(queue.is_empty());
}

#[test]
fn test_order_preserved_across_restart() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_rocks(&dir, QueuePolicy::chat());
        for n in 0..5 {
            queue.enqueue("messages", json!({ "n": n })).unwrap();
            queue.enqueue("reactions", json!({ "n": n })).unwrap();
        }
    }

    let queue = open_rocks(&dir, QueuePolicy::chat());
    let order: Vec<i64> = queue
        .pending("messages")
        .iter()
        .map(|op| op.payload["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(queue.targets(), vec!["messages".to_string(), "reactions".to_string()]);

    // New writes continue after the restored ones
    queue.enqueue("messages", json!({ "n": 5 })).unwrap();
    let last = queue.pending("messages").pop().unwrap();
    assert!(last.sequence > queue.pending("reactions")[4].sequence);
}

#[test]
fn test_bounded_queue_keeps_newest_hundred() {
    let dir = TempDir::new().unwrap();
    {
        let queue = open_rocks(&dir, QueuePolicy::bounded(100));
        for n in 0..150 {
            queue.enqueue("profile_updates", json!({ "n": n })).unwrap();
        }
        assert_eq!(queue.len("profile_updates"), 100);
    }

    let queue = open_rocks(&dir, QueuePolicy::bounded(100));
    let pending = queue.pending("profile_updates");
    assert_eq!(pending.len(), 100, "evictions are persisted too");
    assert_eq!(pending[0].payload["n"], 50);
    assert_eq!(pending[99].payload["n"], 149);
}

#[tokio::test(start_paused = true)]
async fn test_offline_writes_replay_when_connection_returns() {
    let backend = FakeBackend::healthy();
    let manager = ConnectionManager::new(backend.clone(), ConnectionConfig::for_testing());
    let queue = Arc::new(OfflineQueue::open(MemoryQueueStore::new(), QueuePolicy::chat()).unwrap());
    let writer = RecordingWriter::new();
    let _drainer = drain_on_connect(queue.clone(), &manager, writer.clone());

    manager.handle_network_change(false).await;
    for body in ["first", "second", "third"] {
        queue.enqueue("messages", json!({ "body": body })).unwrap();
    }
    let status = queue.queue_status(manager.state());
    assert_eq!(status.status, SyncStatus::Offline);
    assert_eq!(status.message, "Offline: 3 messages waiting to sync");
    assert!(writer.payloads().is_empty());

    manager.handle_network_change(true).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    let bodies: Vec<String> = writer
        .payloads()
        .iter()
        .map(|payload| payload["body"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);
    assert!(queue.is_empty());
    assert_eq!(
        queue.queue_status(manager.state()).status,
        SyncStatus::Synced
    );
    manager.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_waits_for_next_connect() {
    let backend = FakeBackend::healthy();
    let manager = ConnectionManager::new(backend.clone(), ConnectionConfig::for_testing());
    let queue = Arc::new(OfflineQueue::open(MemoryQueueStore::new(), QueuePolicy::chat()).unwrap());
    let writer = RecordingWriter::new();
    writer.set_failing(true);
    let _drainer = drain_on_connect(queue.clone(), &manager, writer.clone());

    queue.enqueue("messages", json!({"body": "hi"})).unwrap();
    manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.pending("messages")[0].retry_count, 1);

    writer.set_failing(false);
    manager.handle_network_change(false).await;
    manager.handle_network_change(true).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(writer.payloads(), vec![json!({"body": "hi"})]);
    assert!(queue.is_empty());
    manager.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_drain_is_skipped() {
    let queue = Arc::new(OfflineQueue::open(MemoryQueueStore::new(), QueuePolicy::chat()).unwrap());
    queue.enqueue("messages", json!({"body": "slow"})).unwrap();
    let writer = RecordingWriter::new();
    writer.set_delay(Duration::from_secs(1));

    let first = {
        let queue = queue.clone();
        let writer = writer.clone();
        tokio::spawn(async move { queue.drain(writer.as_ref()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(queue.is_draining());
    assert_eq!(
        queue.queue_status(ConnectionState::Connected).status,
        SyncStatus::Syncing
    );

    let second = queue.drain(writer.as_ref()).await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.replayed, 0);

    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.replayed, 1);
    assert!(!queue.is_draining());
    assert_eq!(writer.payloads().len(), 1, "each operation written once");
}

#[test]
fn test_status_reports_pending_count() {
    let queue = OfflineQueue::open(MemoryQueueStore::new(), QueuePolicy::chat()).unwrap();
    queue.enqueue("messages", json!({"body": "a"})).unwrap();
    queue.enqueue("messages", json!({"body": "b"})).unwrap();

    let offline = queue.queue_status(ConnectionState::Offline);
    assert_eq!(offline.pending, 2);
    assert!(offline.message.contains('2'));

    let online = queue.queue_status(ConnectionState::Connected);
    assert_eq!(online.status, SyncStatus::Pending);
    assert_eq!(online.message, "2 messages pending");
}
