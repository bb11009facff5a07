//! The "QUEUE" stage - strictly ordered, one-at-a-time batch processing.
//!
//! ```text
//!            submit / flush / close
//!                     │
//!          ┌──────────▼───────────┐
//!          │ pending: VecDeque    │  (≤ max_batch_size pending applies)
//!          └──────────┬───────────┘
//!                     │ next()  (single consumer)
//!   Idle ──start()──► Processing ──queue empty──► Idle
//! ```
//!
//! A batch computed against snapshot N is handed out only after the worker
//! came back for more, i.e. after the batch ending at snapshot N-1 has been
//! fully committed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::marker::Snapshot;
use crate::marker_diff::{create_batch, ChangeDetector, SnapshotDiff};

/// Default number of pending batches buffered before coalescing.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 4;

/// Queue processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Processing,
}

/// A diff tagged with the snapshots it connects.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Submission sequence number
    pub seq: u64,
    /// Snapshot the diff was computed from
    pub base: Arc<Snapshot>,
    /// Snapshot the diff produces
    pub target: Arc<Snapshot>,
    pub diff: SnapshotDiff,
}

/// One unit of work for the queue consumer.
#[derive(Debug, Clone)]
pub enum BatchTask {
    /// Apply an incremental diff
    Apply(Batch),
    /// Drop every handle and redraw `target` from scratch
    Flush { seq: u64, target: Arc<Snapshot> },
    /// Remove every handle and stop
    Dispose,
}

struct QueueInner {
    pending: VecDeque<BatchTask>,
    /// Snapshot the next submitted diff is computed against
    latest: Arc<Snapshot>,
    state: QueueState,
    /// The consumer holds a task it has not finished applying
    in_flight: bool,
    next_seq: u64,
    closed: bool,
}

impl QueueInner {
    /// Applies that count toward the coalescing cap, the one being applied
    /// included.
    fn outstanding_applies(&self) -> usize {
        let pending = self
            .pending
            .iter()
            .filter(|t| matches!(t, BatchTask::Apply(_)))
            .count();
        pending + usize::from(self.in_flight)
    }

    /// Appends `task`, advancing `latest` to what it produces.
    fn push(&mut self, task: BatchTask) {
        match &task {
            BatchTask::Apply(batch) => self.latest = Arc::clone(&batch.target),
            BatchTask::Flush { target, .. } => self.latest = Arc::clone(target),
            BatchTask::Dispose => {}
        }
        self.pending.push_back(task);
    }
}

/// Serialized pipeline of snapshot diffs with a single consumer.
pub struct BatchQueue {
    inner: Mutex<QueueInner>,
    wake: Notify,
    state_tx: watch::Sender<QueueState>,
    max_batch_size: usize,
    detector: ChangeDetector,
}

impl BatchQueue {
    /// Creates an idle queue whose last-seen snapshot is empty.
    pub fn new(max_batch_size: usize, detector: ChangeDetector) -> Self {
        let (state_tx, _) = watch::channel(QueueState::Idle);
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                latest: Arc::new(Snapshot::new()),
                state: QueueState::Idle,
                in_flight: false,
                next_seq: 0,
                closed: false,
            }),
            wake: Notify::new(),
            state_tx,
            max_batch_size: max_batch_size.max(1),
            detector,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut QueueInner, state: QueueState) {
        if inner.state != state {
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Diffs `snapshot` against the last-seen snapshot and enqueues the batch.
    ///
    /// When `max_batch_size` applies are outstanding (pending plus the one
    /// being applied), the newest pending one is rewritten to lead from its
    /// own base straight to `snapshot`.
    ///
    /// # Returns
    /// The batch sequence number, or `None` if nothing needed to be queued
    /// (empty diff, or the queue is closed).
    pub fn submit(&self, snapshot: Arc<Snapshot>) -> Option<u64> {
        let seq = {
            let mut inner = self.lock();
            if inner.closed {
                return None;
            }

            let mut base = Arc::clone(&inner.latest);
            if inner.outstanding_applies() >= self.max_batch_size {
                if let Some(BatchTask::Apply(tail)) = inner.pending.back() {
                    base = Arc::clone(&tail.base);
                    debug!("coalescing batch {} into newer snapshot", tail.seq);
                    inner.pending.pop_back();
                }
            }

            inner.latest = Arc::clone(&snapshot);
            let diff = create_batch(&base, &snapshot, &self.detector);
            if diff.is_empty() {
                return None;
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            debug!(
                "enqueue batch {}: +{} ~{} -{}",
                seq,
                diff.inserted.len(),
                diff.updated.len(),
                diff.deleted.len()
            );
            inner.push(BatchTask::Apply(Batch {
                seq,
                base,
                target: snapshot,
                diff,
            }));
            seq
        };
        self.start();
        Some(seq)
    }

    /// Enqueues a forced full redraw of `snapshot`.
    ///
    /// Pending applies are dropped: the redraw does not depend on them.
    pub fn flush(&self, snapshot: Arc<Snapshot>) -> Option<u64> {
        let seq = {
            let mut inner = self.lock();
            if inner.closed {
                return None;
            }
            let dropped = inner.pending.len();
            inner.pending.clear();
            if dropped > 0 {
                debug!("flush supersedes {} pending batches", dropped);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.push(BatchTask::Flush {
                seq,
                target: snapshot,
            });
            seq
        };
        self.start();
        Some(seq)
    }

    /// Appends a pre-built task without waking the consumer. Pair with
    /// [`BatchQueue::start`].
    ///
    /// An `Apply` must continue the chain: its `base` has to be the snapshot
    /// the previous task produced. Returns `false` if the task was rejected.
    pub fn enqueue(&self, task: BatchTask) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if let BatchTask::Apply(batch) = &task {
            if !Arc::ptr_eq(&batch.base, &inner.latest) {
                warn!("rejecting batch {}: not based on the latest snapshot", batch.seq);
                return false;
            }
            inner.next_seq = inner.next_seq.max(batch.seq + 1);
        }
        inner.push(task);
        true
    }

    /// Wakes the consumer if there is work. No-op while `Processing`.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Processing || inner.pending.is_empty() {
            return;
        }
        self.set_state(&mut inner, QueueState::Processing);
        drop(inner);
        self.wake.notify_one();
    }

    /// Closes the queue: pending work is dropped and a final `Dispose` is queued.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.pending.clear();
            inner.pending.push_back(BatchTask::Dispose);
            inner.latest = Arc::new(Snapshot::new());
            // Force the transition even if the consumer is mid-batch
            self.set_state(&mut inner, QueueState::Processing);
        }
        self.wake.notify_one();
    }

    /// Waits for the next task. Returns `None` once closed and drained.
    ///
    /// Must be called by a single consumer, and only after the previous task
    /// has been fully applied.
    pub async fn next(&self) -> Option<BatchTask> {
        loop {
            {
                let mut inner = self.lock();
                inner.in_flight = false;
                if let Some(task) = inner.pending.pop_front() {
                    inner.in_flight = true;
                    self.set_state(&mut inner, QueueState::Processing);
                    return Some(task);
                }
                self.set_state(&mut inner, QueueState::Idle);
                if inner.closed {
                    return None;
                }
            }
            self.wake.notified().await;
        }
    }

    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot the next submitted diff will be computed against.
    pub fn latest(&self) -> Arc<Snapshot> {
        Arc::clone(&self.lock().latest)
    }

    /// Resolves once the queue is idle with nothing pending.
    pub async fn settled(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|state| *state == QueueState::Idle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::{Marker, MarkerKey};
    use markerflow_env::LatLng;

    fn snap(keys: &[(&str, i64)]) -> Arc<Snapshot> {
        Arc::new(
            keys.iter()
                .map(|(k, ts)| Marker::new(*k, 1, LatLng::new(0.0, 0.0), *ts))
                .collect(),
        )
    }

    fn take_apply(task: BatchTask) -> Batch {
        match task {
            BatchTask::Apply(batch) => batch,
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submission_order_preserved() {
        let queue = BatchQueue::new(8, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));
        queue.submit(snap(&[("a", 0), ("b", 0)]));
        assert_eq!(queue.state(), QueueState::Processing);

        let first = take_apply(queue.next().await.unwrap());
        let second = take_apply(queue.next().await.unwrap());
        assert!(first.seq < second.seq);
        assert_eq!(first.diff.inserted, vec![MarkerKey::from("a")]);
        assert_eq!(second.diff.inserted, vec![MarkerKey::from("b")]);
        assert!(Arc::ptr_eq(&first.target, &second.base));
    }

    #[tokio::test]
    async fn test_empty_diff_not_enqueued() {
        let queue = BatchQueue::new(4, ChangeDetector::Timestamp);
        let s = snap(&[("a", 0)]);
        assert!(queue.submit(Arc::clone(&s)).is_some());
        assert!(queue.submit(s).is_none());
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_coalescing_rewrites_newest_pending() {
        let queue = BatchQueue::new(2, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));
        queue.submit(snap(&[("a", 0), ("b", 0)]));
        // Buffer full: replaces the second batch with {a} -> {a, c}
        queue.submit(snap(&[("a", 0), ("c", 0)]));
        assert_eq!(queue.pending_len(), 2);

        let _first = take_apply(queue.next().await.unwrap());
        let merged = take_apply(queue.next().await.unwrap());
        assert_eq!(merged.diff.inserted, vec![MarkerKey::from("c")]);
        assert!(merged.diff.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_coalescing_flip_flop_cancels_out() {
        let queue = BatchQueue::new(1, ChangeDetector::Timestamp);
        let base = snap(&[("a", 0)]);
        queue.submit(Arc::clone(&base));
        let _ = queue.next().await; // consumer busy with the first batch

        let with_b = snap(&[("a", 0), ("b", 0)]);
        queue.submit(with_b);
        // Removing b again before the insert started rewrites the pending batch
        queue.submit(Arc::new(base.floor_subset(1)));
        // {a} -> {a} with the same Arc: nothing to do
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_batch_being_applied_counts_toward_cap() {
        let queue = BatchQueue::new(2, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));
        let _applying = take_apply(queue.next().await.unwrap());

        queue.submit(snap(&[("a", 0), ("b", 0)]));
        // One applying plus one pending reaches the cap of 2
        queue.submit(snap(&[("a", 0), ("c", 0)]));
        assert_eq!(queue.pending_len(), 1);

        let merged = take_apply(queue.next().await.unwrap());
        assert_eq!(merged.diff.inserted, vec![MarkerKey::from("c")]);
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_start() {
        let queue = BatchQueue::new(4, ChangeDetector::Timestamp);
        let base = queue.latest();
        let target = snap(&[("a", 0)]);
        let batch = Batch {
            seq: 0,
            base: Arc::clone(&base),
            target: Arc::clone(&target),
            diff: create_batch(&base, &target, &ChangeDetector::Timestamp),
        };

        assert!(queue.enqueue(BatchTask::Apply(batch)));
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(Arc::ptr_eq(&queue.latest(), &target));

        queue.start();
        assert_eq!(queue.state(), QueueState::Processing);
        let applied = take_apply(queue.next().await.unwrap());
        assert_eq!(applied.diff.inserted, vec![MarkerKey::from("a")]);

        // A later submit continues the chain from the enqueued target
        let seq = queue.submit(snap(&[("a", 0), ("b", 0)])).unwrap();
        assert!(seq > applied.seq);
        let next = take_apply(queue.next().await.unwrap());
        assert!(Arc::ptr_eq(&next.base, &target));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_broken_chain() {
        let queue = BatchQueue::new(4, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));

        let stale_base = Arc::new(Snapshot::new());
        let target = snap(&[("b", 0)]);
        let batch = Batch {
            seq: 7,
            base: Arc::clone(&stale_base),
            target: Arc::clone(&target),
            diff: create_batch(&stale_base, &target, &ChangeDetector::Timestamp),
        };

        assert!(!queue.enqueue(BatchTask::Apply(batch)));
        assert_eq!(queue.pending_len(), 1);
        assert!(!Arc::ptr_eq(&queue.latest(), &target));
    }

    #[tokio::test]
    async fn test_flush_supersedes_pending() {
        let queue = BatchQueue::new(4, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));
        queue.submit(snap(&[("b", 0)]));
        queue.flush(snap(&[("c", 0)]));
        assert_eq!(queue.pending_len(), 1);
        assert!(matches!(queue.next().await, Some(BatchTask::Flush { .. })));
    }

    #[tokio::test]
    async fn test_close_drains_to_none() {
        let queue = BatchQueue::new(4, ChangeDetector::Timestamp);
        queue.submit(snap(&[("a", 0)]));
        queue.close();
        assert!(queue.submit(snap(&[("b", 0)])).is_none());
        assert!(matches!(queue.next().await, Some(BatchTask::Dispose)));
        assert!(queue.next().await.is_none());
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn test_settled_after_drain() {
        let queue = Arc::new(BatchQueue::new(4, ChangeDetector::Timestamp));
        queue.submit(snap(&[("a", 0)]));

        let consumer = Arc::clone(&queue);
        let worker = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(task) = consumer.next().await {
                if matches!(task, BatchTask::Dispose) {
                    break;
                }
                seen += 1;
            }
            seen
        });

        queue.settled().await;
        assert_eq!(queue.pending_len(), 0);
        queue.close();
        assert_eq!(worker.await.unwrap(), 1);
    }
}
