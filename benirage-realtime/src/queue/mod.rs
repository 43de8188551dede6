//! Offline write queue.
//!
//! Architecture:
//! ```text
//! ┌──────────┐ enqueue ┌──────────────────────────┐ commit ┌─────────────┐
//! │ caller   │ ──────► │ OfflineQueue             │ ─────► │ QueueStore  │
//! └──────────┘         │  target → [op, op, ...]  │        │ (RocksDB)   │
//!                      └────────────┬─────────────┘        └─────────────┘
//!                                   │ drain (on connect / on demand)
//!                                   ▼
//!                            ┌─────────────┐
//!                            │ DataWriter  │
//!                            └─────────────┘
//! ```
//!
//! Every mutation reaches the store before the call returns, so a crash
//! loses at most the in-flight replay, never the record of intent.

pub mod store;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{DataWriter, RealtimeBackend};
use crate::connection::{ConnectionManager, ConnectionState};

pub use store::{
    MemoryQueueStore, QueueStore, RecordKey, Recovered, RocksQueueStore, StoreBatch, StoreConfig,
    StoreError,
};

/// Replay attempts before an operation is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Cap of the generic offline-data queue.
pub const DEFAULT_BOUNDED_LEN: usize = 100;

/// One pending write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    /// Logical room or table the write goes to
    pub target: String,
    /// Store-wide enqueue order
    pub sequence: u64,
    pub payload: Value,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub retry_count: u32,
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Size and retry limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Per-target cap; the oldest operations are dropped beyond it
    pub max_len: Option<usize>,
    pub max_retries: u32,
}

impl QueuePolicy {
    /// Chat messages: unbounded.
    pub fn chat() -> Self {
        Self {
            max_len: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Generic offline data: ring buffer of `max_len` operations.
    pub fn bounded(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::chat()
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Operations written and removed
    pub replayed: usize,
    /// Failed operations kept for the next pass
    pub retained: usize,
    /// Operations removed after reaching the retry cap
    pub dropped: Vec<QueuedOperation>,
    /// Another drain was already running; nothing was attempted
    pub skipped: bool,
}

/// Queue summary for UI badges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Offline,
    Syncing,
    Pending,
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub status: SyncStatus,
    pub pending: usize,
    pub message: String,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Clears the draining flag when the pass ends, even on early return.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Durable per-target write queue.
pub struct OfflineQueue<S: QueueStore> {
    store: S,
    policy: QueuePolicy,
    queues: Mutex<HashMap<String, VecDeque<QueuedOperation>>>,
    sequence: AtomicU64,
    draining: AtomicBool,
}

impl<S: QueueStore> OfflineQueue<S> {
    /// Load every persisted operation from `store`.
    pub fn open(store: S, policy: QueuePolicy) -> Result<Self, QueueError> {
        let recovered = store.load()?;
        if recovered.corrupted > 0 {
            log::warn!(
                "Offline queue recovered with {} corrupted record(s) skipped",
                recovered.corrupted
            );
        }

        let mut queues: HashMap<String, VecDeque<QueuedOperation>> = HashMap::new();
        let mut next_sequence = 0;
        let mut operations = recovered.operations;
        operations.sort_by_key(|op| op.sequence);
        for op in operations {
            next_sequence = next_sequence.max(op.sequence + 1);
            queues.entry(op.target.clone()).or_default().push_back(op);
        }
        let total: usize = queues.values().map(VecDeque::len).sum();
        if total > 0 {
            log::info!("Offline queue restored {total} pending operation(s)");
        }

        Ok(Self {
            store,
            policy,
            queues: Mutex::new(queues),
            sequence: AtomicU64::new(next_sequence),
            draining: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<QueuedOperation>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a write for `target`. Returns its id for later cancellation.
    pub fn enqueue(&self, target: &str, payload: Value) -> Result<Uuid, QueueError> {
        // Sequence is taken under the lock so per-target order matches the store
        let mut queues = self.queues();
        let op = QueuedOperation {
            id: Uuid::new_v4(),
            target: target.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            payload,
            created_at: now_millis(),
            retry_count: 0,
        };
        let id = op.id;

        let queued = queues.get(target).map_or(0, VecDeque::len);
        let overflow = match self.policy.max_len.map(|max| max.max(1)) {
            Some(max) if queued >= max => queued + 1 - max,
            _ => 0,
        };

        let mut batch = StoreBatch::default().put(op.clone());
        if let Some(queue) = queues.get(target) {
            for evicted in queue.iter().take(overflow) {
                batch = batch.delete(RecordKey::of(evicted));
            }
        }
        self.store.commit(batch)?;

        let queue = queues.entry(target.to_string()).or_default();
        for evicted in queue.drain(..overflow) {
            log::warn!("Offline queue for {target} full, dropped oldest operation {}", evicted.id);
        }
        queue.push_back(op);
        log::debug!("Queued operation {id} for {target} ({} pending)", queue.len());
        Ok(id)
    }

    /// Cancel one operation. Returns whether it was queued.
    pub fn remove(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut queues = self.queues();
        let found = queues.iter().find_map(|(target, queue)| {
            queue
                .iter()
                .position(|op| op.id == id)
                .map(|index| (target.clone(), index))
        });
        let Some((target, index)) = found else {
            return Ok(false);
        };

        let Some(queue) = queues.get_mut(&target) else {
            return Ok(false);
        };
        self.store
            .commit(StoreBatch::default().delete(RecordKey::of(&queue[index])))?;
        queue.remove(index);
        if queue.is_empty() {
            queues.remove(&target);
        }
        Ok(true)
    }

    /// Drop every operation for `target`. Returns how many were removed.
    pub fn clear(&self, target: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues();
        let Some(queue) = queues.get(target) else {
            return Ok(0);
        };
        let batch = queue
            .iter()
            .fold(StoreBatch::default(), |batch, op| batch.delete(RecordKey::of(op)));
        self.store.commit(batch)?;
        let removed = queues.remove(target).map_or(0, |q| q.len());
        log::info!("Cleared {removed} queued operation(s) for {target}");
        Ok(removed)
    }

    /// Drop every operation for every target.
    pub fn clear_all(&self) -> Result<usize, QueueError> {
        let mut queues = self.queues();
        let batch = queues
            .values()
            .flatten()
            .fold(StoreBatch::default(), |batch, op| batch.delete(RecordKey::of(op)));
        self.store.commit(batch)?;
        let removed = queues.values().map(VecDeque::len).sum();
        queues.clear();
        Ok(removed)
    }

    /// Pending operations for `target` in enqueue order.
    pub fn pending(&self, target: &str) -> Vec<QueuedOperation> {
        self.queues()
            .get(target)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, target: &str) -> usize {
        self.queues().get(target).map_or(0, VecDeque::len)
    }

    pub fn total_len(&self) -> usize {
        self.queues().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Targets with at least one pending operation, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.queues().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replay every target's operations once, in enqueue order.
    pub async fn drain<W: DataWriter + ?Sized>(&self, writer: &W) -> Result<DrainReport, QueueError> {
        self.drain_targets(writer, None).await
    }

    /// Replay one target's operations once, in enqueue order.
    pub async fn drain_target<W: DataWriter + ?Sized>(
        &self,
        target: &str,
        writer: &W,
    ) -> Result<DrainReport, QueueError> {
        self.drain_targets(writer, Some(target)).await
    }

    async fn drain_targets<W: DataWriter + ?Sized>(
        &self,
        writer: &W,
        only: Option<&str>,
    ) -> Result<DrainReport, QueueError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Drain already in progress, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot: Vec<QueuedOperation> = {
            let queues = self.queues();
            let mut ops: Vec<QueuedOperation> = queues
                .iter()
                .filter(|(target, _)| only.is_none_or(|only| only == target.as_str()))
                .flat_map(|(_, queue)| queue.iter().cloned())
                .collect();
            ops.sort_by_key(|op| op.sequence);
            ops
        };

        let mut report = DrainReport::default();
        for op in snapshot {
            match writer.write(&op.target, &op.payload).await {
                Ok(()) => {
                    self.settle(&op, None)?;
                    report.replayed += 1;
                }
                Err(err) => {
                    let retry_count = op.retry_count + 1;
                    if retry_count >= self.policy.max_retries {
                        log::warn!(
                            "Dropping operation {} for {} after {retry_count} failed attempts: {err}",
                            op.id,
                            op.target
                        );
                        if self.settle(&op, None)? {
                            report.dropped.push(QueuedOperation { retry_count, ..op });
                        }
                    } else {
                        log::debug!(
                            "Replay of {} failed (attempt {retry_count}): {err}",
                            op.id
                        );
                        if self.settle(&op, Some(retry_count))? {
                            report.retained += 1;
                        }
                    }
                }
            }
        }

        if report.replayed > 0 || !report.dropped.is_empty() {
            log::info!(
                "Drain finished: {} replayed, {} retained, {} dropped",
                report.replayed,
                report.retained,
                report.dropped.len()
            );
        }
        Ok(report)
    }

    /// Remove `op` (`retry_count` None) or persist its new retry count.
    ///
    /// Returns false when the operation was cancelled during the replay.
    fn settle(&self, op: &QueuedOperation, retry_count: Option<u32>) -> Result<bool, QueueError> {
        let mut queues = self.queues();
        let Some(queue) = queues.get_mut(&op.target) else {
            return Ok(false);
        };
        let Some(index) = queue.iter().position(|queued| queued.id == op.id) else {
            return Ok(false);
        };

        match retry_count {
            Some(retry_count) => {
                let updated = QueuedOperation {
                    retry_count,
                    ..queue[index].clone()
                };
                self.store.commit(StoreBatch::default().put(updated.clone()))?;
                queue[index] = updated;
            }
            None => {
                self.store
                    .commit(StoreBatch::default().delete(RecordKey::of(op)))?;
                queue.remove(index);
                if queue.is_empty() {
                    queues.remove(&op.target);
                }
            }
        }
        Ok(true)
    }

    /// Summary for a status badge given the current connection state.
    pub fn queue_status(&self, state: ConnectionState) -> QueueStatus {
        let pending = self.total_len();
        let (status, message) = if state == ConnectionState::Offline {
            (
                SyncStatus::Offline,
                format!("Offline: {pending} {} waiting to sync", plural(pending)),
            )
        } else if self.is_draining() {
            (
                SyncStatus::Syncing,
                format!("Syncing {pending} {}...", plural(pending)),
            )
        } else if pending > 0 {
            (
                SyncStatus::Pending,
                format!("{pending} {} pending", plural(pending)),
            )
        } else {
            (SyncStatus::Synced, "All changes synced".to_string())
        };
        QueueStatus {
            status,
            pending,
            message,
        }
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        "message"
    } else {
        "messages"
    }
}

/// Drain `queue` into `writer` every time `manager` becomes connected.
///
/// Runs until the manager is dropped.
pub fn drain_on_connect<S, B, W>(
    queue: Arc<OfflineQueue<S>>,
    manager: &ConnectionManager<B>,
    writer: Arc<W>,
) -> JoinHandle<()>
where
    S: QueueStore + 'static,
    B: RealtimeBackend,
    W: DataWriter + ?Sized + 'static,
{
    let mut state = manager.watch_state();
    tokio::spawn(async move {
        let mut was_connected = false;
        loop {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if connected && !was_connected && !queue.is_empty() {
                match queue.drain(writer.as_ref()).await {
                    Ok(report) if !report.dropped.is_empty() => log::warn!(
                        "{} queued operation(s) dropped after repeated failures",
                        report.dropped.len()
                    ),
                    Ok(_) => {}
                    Err(e) => log::error!("Offline queue drain failed: {e}"),
                }
            }
            was_connected = connected;
            if state.changed().await.is_err() {
                break;
            }
        }
    })
}
