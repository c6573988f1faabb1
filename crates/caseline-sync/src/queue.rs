//! # Offline Queue
//!
//! Durable, ordered, retry-bounded buffer of operations the server has not
//! acknowledged yet.
//!
//! ## Queue Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Offline Queue Flow                                │
//! │                                                                         │
//! │   queue_operation()                                                    │
//! │         │                                                               │
//! │         ▼                                                               │
//! │   ┌──────────────────────────────┐      ┌─────────────────────────┐    │
//! │   │  in_flight  │     pending    │ ───► │  KeyValueStore          │    │
//! │   │  (sent)     │  (not sent)    │      │  "sync:offline-queue"   │    │
//! │   │  op1 op2    │  op3 op4 op5 ◄─┼─ enqueue (back)                │    │
//! │   └──────┬──────┴────────────────┘      │  [op1 .. op5] in order  │    │
//! │          │                               └─────────────────────────┘    │
//! │          │ echo received         ──► confirm(ids): removed + persisted  │
//! │          │ send failed / timeout ──► requeue at FRONT, retry_count += 1 │
//! │          │ retry_count > limit   ──► abandoned (reported, discarded)    │
//! │                                                                         │
//! │  The persisted list is always in_flight followed by pending, so the    │
//! │  stored order is the transmission order across restarts.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use caseline_core::{now_millis, SyncOperation};
use caseline_store::{KeyValueStore, StoreResult, OFFLINE_QUEUE_KEY};

// =============================================================================
// Queue Entries
// =============================================================================

/// One operation waiting for acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub operation: SyncOperation,

    /// Failed transmission attempts so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Unix milliseconds when the operation was queued.
    pub enqueued_at: i64,
}

impl QueuedOperation {
    fn new(operation: SyncOperation) -> Self {
        QueuedOperation {
            operation,
            retry_count: 0,
            enqueued_at: now_millis(),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    entry: QueuedOperation,
    sent_at: Instant,
}

// =============================================================================
// Offline Queue
// =============================================================================

/// FIFO of unacknowledged operations, mirrored to a [`KeyValueStore`].
///
/// Owned by the client behind a single `tokio::sync::Mutex`; every mutating
/// call writes the full list before returning.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,

    /// Sent, waiting for the echo. Always older than everything in `pending`.
    in_flight: Vec<InFlight>,

    pending: VecDeque<QueuedOperation>,

    max_entries: usize,

    retry_attempts: u32,

    /// Set once the stored queue has been merged in. Until then nothing is
    /// written, so a failed read can never clobber the stored list.
    loaded: bool,

    /// A write failed or was deferred.
    dirty: bool,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, max_entries: usize, retry_attempts: u32) -> Self {
        OfflineQueue {
            store,
            in_flight: Vec::new(),
            pending: VecDeque::new(),
            max_entries,
            retry_attempts,
            loaded: false,
            dirty: false,
        }
    }

    /// Reconstructs the queue from storage. Idempotent.
    ///
    /// Stored entries are older than anything queued in this process, so
    /// they go in front. Returns entries evicted to respect the cap.
    ///
    /// ## Errors
    /// A storage read failure leaves the queue unloaded; the next call retries.
    pub async fn load(&mut self) -> StoreResult<Vec<QueuedOperation>> {
        if self.loaded {
            return Ok(Vec::new());
        }

        let stored = match self.store.get(OFFLINE_QUEUE_KEY).await? {
            Some(raw) => match serde_json::from_str::<Vec<QueuedOperation>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable offline queue");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let known: HashSet<String> = self
            .in_flight
            .iter()
            .map(|f| f.entry.operation.id.clone())
            .chain(self.pending.iter().map(|e| e.operation.id.clone()))
            .collect();

        let restored: Vec<QueuedOperation> = stored
            .into_iter()
            .filter(|e| !known.contains(&e.operation.id))
            .collect();

        info!(restored = restored.len(), "Offline queue loaded");

        for entry in restored.into_iter().rev() {
            self.pending.push_front(entry);
        }

        self.loaded = true;
        let evicted = self.evict_overflow();
        self.persist().await;

        Ok(evicted)
    }

    /// Appends an operation and persists the queue.
    ///
    /// Returns the entries evicted to stay under the cap (oldest first).
    pub async fn enqueue(&mut self, operation: SyncOperation) -> Vec<QueuedOperation> {
        let mut evicted = match self.load().await {
            Ok(evicted) => evicted,
            Err(e) => {
                error!(error = %e, "Failed to load offline queue, keeping in memory");
                Vec::new()
            }
        };

        debug!(operation_id = %operation.id, session_id = %operation.session_id, "Queueing operation");
        self.pending.push_back(QueuedOperation::new(operation));

        evicted.extend(self.evict_overflow());
        self.persist().await;

        evicted
    }

    /// Moves up to `max` oldest pending operations in flight and returns them
    /// for transmission. They stay persisted until confirmed.
    pub fn drain_batch(&mut self, max: usize, now: Instant) -> Vec<SyncOperation> {
        let take = max.min(self.pending.len());
        let mut batch = Vec::with_capacity(take);

        for entry in self.pending.drain(..take) {
            batch.push(entry.operation.clone());
            self.in_flight.push(InFlight {
                entry,
                sent_at: now,
            });
        }

        batch
    }

    /// Returns every in-flight operation to the front of the queue as a
    /// failed attempt, preserving order.
    ///
    /// Entries whose retry count now exceeds the limit are removed and
    /// returned.
    pub async fn requeue_in_flight(&mut self) -> Vec<QueuedOperation> {
        if self.in_flight.is_empty() {
            return Vec::new();
        }

        let mut abandoned = Vec::new();
        let mut retry = Vec::new();

        for InFlight { mut entry, .. } in self.in_flight.drain(..) {
            entry.retry_count += 1;
            if entry.retry_count > self.retry_attempts {
                warn!(
                    operation_id = %entry.operation.id,
                    attempts = entry.retry_count,
                    "Abandoning operation after exhausting retries"
                );
                abandoned.push(entry);
            } else {
                retry.push(entry);
            }
        }

        debug!(requeued = retry.len(), abandoned = abandoned.len(), "Requeued in-flight operations");

        for entry in retry.into_iter().rev() {
            self.pending.push_front(entry);
        }

        self.persist().await;
        abandoned
    }

    /// Returns in-flight operations to the front without counting a retry.
    ///
    /// Used on explicit disconnect, where nothing failed.
    pub fn release_in_flight(&mut self) {
        for InFlight { entry, .. } in self.in_flight.drain(..).rev() {
            self.pending.push_front(entry);
        }
    }

    /// Requeues everything in flight if the oldest in-flight operation has
    /// waited longer than `ack_timeout` for its echo.
    pub async fn requeue_if_stale(
        &mut self,
        now: Instant,
        ack_timeout: Duration,
    ) -> Vec<QueuedOperation> {
        let stale = self
            .in_flight
            .first()
            .is_some_and(|f| now.saturating_duration_since(f.sent_at) >= ack_timeout);

        if !stale {
            return Vec::new();
        }

        info!(in_flight = self.in_flight.len(), "Acknowledgment timed out, resending");
        self.requeue_in_flight().await
    }

    /// Removes acknowledged operations. Returns how many were removed.
    pub async fn confirm(&mut self, ids: &[&str]) -> usize {
        let before = self.len();

        self.in_flight
            .retain(|f| !ids.contains(&f.entry.operation.id.as_str()));
        self.pending
            .retain(|e| !ids.contains(&e.operation.id.as_str()));

        let removed = before - self.len();
        if removed > 0 {
            debug!(removed, "Confirmed operations");
            self.persist().await;
        }
        removed
    }

    /// Retries a write that failed earlier.
    pub async fn persist_if_dirty(&mut self) {
        if self.dirty {
            self.persist().await;
        }
    }

    /// Writes the full queue under [`OFFLINE_QUEUE_KEY`].
    ///
    /// Failures are logged and the queue stays in memory.
    async fn persist(&mut self) {
        if !self.loaded {
            self.dirty = true;
            return;
        }

        let raw = match serde_json::to_string(&self.snapshot()) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Failed to serialize offline queue");
                self.dirty = true;
                return;
            }
        };

        match self.store.set(OFFLINE_QUEUE_KEY, raw).await {
            Ok(()) => self.dirty = false,
            Err(e) => {
                error!(error = %e, "Failed to persist offline queue");
                self.dirty = true;
            }
        }
    }

    fn evict_overflow(&mut self) -> Vec<QueuedOperation> {
        let mut evicted = Vec::new();

        while self.len() > self.max_entries {
            let oldest = if self.in_flight.is_empty() {
                self.pending.pop_front()
            } else {
                Some(self.in_flight.remove(0).entry)
            };

            match oldest {
                Some(entry) => {
                    warn!(operation_id = %entry.operation.id, "Offline queue full, evicting oldest operation");
                    evicted.push(entry);
                }
                None => break,
            }
        }

        evicted
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// All entries in transmission order.
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        self.in_flight
            .iter()
            .map(|f| f.entry.clone())
            .chain(self.pending.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("in_flight", &self.in_flight.len())
            .field("pending", &self.pending.len())
            .field("max_entries", &self.max_entries)
            .field("loaded", &self.loaded)
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FailingStore;
    use caseline_core::EventType;
    use caseline_store::MemoryStore;
    use serde_json::json;

    fn op(n: u32) -> SyncOperation {
        SyncOperation::new("S", EventType::EvidenceAdded, json!({ "n": n }), "alice", n as i64)
    }

    fn ids(entries: &[QueuedOperation]) -> Vec<String> {
        entries.iter().map(|e| e.operation.id.clone()).collect()
    }

    fn op_ids(ops: &[SyncOperation]) -> Vec<String> {
        ops.iter().map(|o| o.id.clone()).collect()
    }

    async fn stored(store: &MemoryStore) -> Vec<QueuedOperation> {
        let raw = store.get(OFFLINE_QUEUE_KEY).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);

        let first = op(1);
        queue.enqueue(first.clone()).await;

        let persisted = stored(&store).await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].operation, first);
        assert_eq!(persisted[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_reload_preserves_ids_and_order() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);
        for n in 0..5 {
            queue.enqueue(op(n)).await;
        }
        queue.drain_batch(2, Instant::now());
        let before = ids(&queue.snapshot());

        let mut restarted = OfflineQueue::new(Arc::new(store), 10, 3);
        restarted.load().await.unwrap();

        assert_eq!(ids(&restarted.snapshot()), before);
        assert_eq!(restarted.pending_len(), 5);
    }

    #[tokio::test]
    async fn test_failed_batch_requeued_at_front_in_order() {
        let mut queue = OfflineQueue::new(Arc::new(MemoryStore::new()), 10, 3);
        let ops: Vec<_> = (0..4).map(op).collect();
        for o in &ops {
            queue.enqueue(o.clone()).await;
        }

        let batch = queue.drain_batch(2, Instant::now());
        assert_eq!(op_ids(&batch), op_ids(&ops[..2]));

        queue.enqueue(op(9)).await;
        let abandoned = queue.requeue_in_flight().await;
        assert!(abandoned.is_empty());

        let order = queue.drain_batch(10, Instant::now());
        assert_eq!(op_ids(&order[..4]), op_ids(&ops));
        assert_eq!(queue.snapshot()[0].retry_count, 1);
        assert_eq!(queue.snapshot()[2].retry_count, 0);
    }

    #[tokio::test]
    async fn test_abandons_after_retry_limit() {
        let mut queue = OfflineQueue::new(Arc::new(MemoryStore::new()), 10, 3);
        let doomed = op(1);
        queue.enqueue(doomed.clone()).await;

        for _ in 0..3 {
            queue.drain_batch(10, Instant::now());
            assert!(queue.requeue_in_flight().await.is_empty());
        }

        queue.drain_batch(10, Instant::now());
        let abandoned = queue.requeue_in_flight().await;

        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].operation, doomed);
        assert_eq!(abandoned[0].retry_count, 4);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_first() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 3, 3);
        let ops: Vec<_> = (0..4).map(op).collect();

        for o in &ops[..3] {
            assert!(queue.enqueue(o.clone()).await.is_empty());
        }
        queue.drain_batch(1, Instant::now());

        let evicted = queue.enqueue(ops[3].clone()).await;
        assert_eq!(ids(&evicted), vec![ops[0].id.clone()]);
        assert_eq!(ids(&stored(&store).await), op_ids(&ops[1..]));
    }

    #[tokio::test]
    async fn test_confirm_removes_in_flight_and_pending() {
        let store = MemoryStore::new();
        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);
        let ops: Vec<_> = (0..3).map(op).collect();
        for o in &ops {
            queue.enqueue(o.clone()).await;
        }
        queue.drain_batch(1, Instant::now());

        let removed = queue.confirm(&[ops[0].id.as_str(), ops[2].id.as_str()]).await;
        assert_eq!(removed, 2);
        assert_eq!(ids(&stored(&store).await), vec![ops[1].id.clone()]);

        assert_eq!(queue.confirm(&["unknown"]).await, 0);
    }

    #[tokio::test]
    async fn test_load_puts_stored_entries_first() {
        let store = MemoryStore::new();
        let older = op(1);
        {
            let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);
            queue.enqueue(older.clone()).await;
        }

        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);
        let newer = op(2);
        queue.enqueue(newer.clone()).await;

        assert_eq!(ids(&queue.snapshot()), vec![older.id.clone(), newer.id.clone()]);
        assert_eq!(ids(&stored(&store).await), vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_unreadable_stored_queue_is_discarded() {
        let store = MemoryStore::new();
        store.set(OFFLINE_QUEUE_KEY, "{not json".to_string()).await.unwrap();

        let mut queue = OfflineQueue::new(Arc::new(store.clone()), 10, 3);
        queue.load().await.unwrap();

        assert!(queue.is_empty());
        assert!(queue.is_loaded());
        assert_eq!(stored(&store).await, Vec::new());
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_queue_in_memory() {
        let mut queue = OfflineQueue::new(Arc::new(FailingStore), 10, 3);

        queue.enqueue(op(1)).await;
        queue.enqueue(op(2)).await;

        assert_eq!(queue.len(), 2);
        assert!(!queue.is_loaded());
        assert!(queue.is_dirty());
        assert!(queue.load().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_if_stale() {
        let mut queue = OfflineQueue::new(Arc::new(MemoryStore::new()), 10, 3);
        queue.enqueue(op(1)).await;

        let sent_at = Instant::now();
        queue.drain_batch(10, sent_at);
        let timeout = Duration::from_secs(30);

        queue.requeue_if_stale(sent_at + Duration::from_secs(29), timeout).await;
        assert_eq!(queue.in_flight_len(), 1);

        queue.requeue_if_stale(sent_at + timeout, timeout).await;
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.snapshot()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_release_in_flight_does_not_count_retry() {
        let mut queue = OfflineQueue::new(Arc::new(MemoryStore::new()), 10, 3);
        queue.enqueue(op(1)).await;
        queue.enqueue(op(2)).await;

        queue.drain_batch(1, Instant::now());
        queue.release_in_flight();

        let snapshot = queue.snapshot();
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(snapshot[0].operation.timestamp, 1);
        assert_eq!(snapshot[0].retry_count, 0);
    }
}
