//! Reconciler worker - drains the batch queue into the handle manager.
//!
//! ```text
//! reconcile(S) ──► BatchQueue ──next()──► worker ──► MarkerHandleManager ──► RenderEngine
//!                                            │
//!                                            └──► watch<Arc<LiveSet>>  (committed sets only)
//! ```

use std::sync::Arc;

use markerflow_env::{MapContext, RenderEngine};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::batch_queue::{BatchQueue, BatchTask, QueueState};
use crate::marker::Snapshot;
use crate::marker_diff::ChangeDetector;
use crate::marker_handles::{LiveSet, MarkerFactory, MarkerHandleManager};

/// Handle to a running reconciliation worker.
///
/// Dropping it closes the queue; the worker then removes every handle.
pub struct MarkerReconciler {
    queue: Arc<BatchQueue>,
    live_rx: watch::Receiver<Arc<LiveSet>>,
    stopped_rx: watch::Receiver<bool>,
}

impl MarkerReconciler {
    /// Spawns the worker on `ctx`.
    pub fn spawn<C, E>(
        ctx: &C,
        engine: Arc<E>,
        factory: MarkerFactory,
        max_batch_size: usize,
        detector: ChangeDetector,
    ) -> Self
    where
        C: MapContext,
        E: RenderEngine,
    {
        let queue = Arc::new(BatchQueue::new(max_batch_size, detector));
        let (live_tx, live_rx) = watch::channel(Arc::new(LiveSet::default()));
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let manager = MarkerHandleManager::new(engine, factory);
        ctx.spawn(
            "reconciler",
            run_worker(Arc::clone(&queue), manager, live_tx, stopped_tx),
        );

        Self {
            queue,
            live_rx,
            stopped_rx,
        }
    }

    /// Diffs `snapshot` against the last one seen and queues the batch.
    pub fn reconcile(&self, snapshot: Arc<Snapshot>) -> Option<u64> {
        self.queue.submit(snapshot)
    }

    /// Queues a full redraw of `snapshot`.
    pub fn force_redraw(&self, snapshot: Arc<Snapshot>) -> Option<u64> {
        self.queue.flush(snapshot)
    }

    /// Stops accepting work; the worker removes every handle and exits.
    pub fn dispose(&self) {
        self.queue.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.queue.is_closed()
    }

    /// The last committed live set.
    pub fn live(&self) -> Arc<LiveSet> {
        Arc::clone(&self.live_rx.borrow())
    }

    pub fn subscribe_live(&self) -> watch::Receiver<Arc<LiveSet>> {
        self.live_rx.clone()
    }

    pub fn state(&self) -> QueueState {
        self.queue.state()
    }

    /// Snapshot the next diff will be computed against.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.queue.latest()
    }

    /// Resolves once every queued batch has been committed.
    pub async fn settled(&self) {
        self.queue.settled().await;
    }

    /// Resolves once the worker has exited after [`dispose`](Self::dispose).
    pub async fn stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for MarkerReconciler {
    fn drop(&mut self) {
        self.queue.close();
    }
}

async fn run_worker<E: RenderEngine>(
    queue: Arc<BatchQueue>,
    mut manager: MarkerHandleManager<E>,
    live_tx: watch::Sender<Arc<LiveSet>>,
    stopped_tx: watch::Sender<bool>,
) {
    while let Some(task) = queue.next().await {
        match task {
            BatchTask::Apply(batch) => {
                let report = manager.apply_diff(&batch.diff, &batch.target).await;
                debug!(
                    "batch {} committed: +{} -{} failed {}",
                    batch.seq, report.created, report.removed, report.failed
                );
            }
            BatchTask::Flush { seq, target } => {
                let report = manager.flush(&target).await;
                debug!(
                    "flush {} committed: +{} -{} failed {}",
                    seq, report.created, report.removed, report.failed
                );
            }
            BatchTask::Dispose => {
                let removed = manager.dispose();
                info!("Reconciler disposed, removed {} handles", removed);
            }
        }
        live_tx.send_replace(Arc::new(manager.live().clone()));
    }
    drop(manager);
    stopped_tx.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_queue::DEFAULT_MAX_BATCH_SIZE;
    use crate::marker::{Marker, MarkerKey};
    use crate::test_support::RecordingEngine;
    use markerflow_env::{LatLng, TokioContext};

    fn snap(keys: &[(&str, i64)]) -> Arc<Snapshot> {
        Arc::new(
            keys.iter()
                .map(|(k, ts)| Marker::new(*k, 1, LatLng::new(0.0, 0.0), *ts))
                .collect(),
        )
    }

    fn reconciler(engine: &Arc<RecordingEngine>) -> MarkerReconciler {
        MarkerReconciler::spawn(
            &TokioContext::new(),
            Arc::clone(engine),
            MarkerFactory::default(),
            DEFAULT_MAX_BATCH_SIZE,
            ChangeDetector::Timestamp,
        )
    }

    #[tokio::test]
    async fn test_reconcile_twice_is_idempotent() {
        let engine = Arc::new(RecordingEngine::new());
        let r = reconciler(&engine);
        let s = snap(&[("a", 1), ("b", 1)]);

        assert!(r.reconcile(Arc::clone(&s)).is_some());
        r.settled().await;
        let ops = engine.op_count();

        assert!(r.reconcile(Arc::clone(&s)).is_none());
        r.settled().await;
        assert_eq!(engine.op_count(), ops);
        assert_eq!(r.live().len(), 2);
    }

    #[tokio::test]
    async fn test_rapid_snapshots_converge_to_last() {
        let engine = Arc::new(RecordingEngine::new());
        let r = reconciler(&engine);

        r.reconcile(snap(&[("a", 1), ("b", 1)]));
        r.reconcile(snap(&[("b", 2), ("c", 1)]));
        let last = snap(&[("c", 1), ("d", 1)]);
        r.reconcile(Arc::clone(&last));
        r.settled().await;

        let live = r.live();
        let mut keys: Vec<_> = live.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec![MarkerKey::from("c"), MarkerKey::from("d")]);
        assert_eq!(engine.alive_count(), 2);
        for (_, entry) in live.iter() {
            assert!(engine.is_alive(entry.handle));
        }
    }

    #[tokio::test]
    async fn test_force_redraw_replaces_handles() {
        let engine = Arc::new(RecordingEngine::new());
        let r = reconciler(&engine);
        let s = snap(&[("a", 1)]);
        r.reconcile(Arc::clone(&s));
        r.settled().await;
        let before = r.live().handle(&"a".into()).unwrap();

        r.force_redraw(s);
        r.settled().await;
        let after = r.live().handle(&"a".into()).unwrap();
        assert_ne!(before, after);
        assert!(!engine.is_alive(before));
        assert!(engine.is_alive(after));
    }

    #[tokio::test]
    async fn test_dispose_removes_everything_and_stops() {
        let engine = Arc::new(RecordingEngine::new());
        let r = reconciler(&engine);
        r.reconcile(snap(&[("a", 1), ("b", 1)]));
        r.dispose();
        r.stopped().await;

        assert!(r.live().is_empty());
        assert_eq!(engine.alive_count(), 0);
        assert!(r.reconcile(snap(&[("z", 1)])).is_none());
        assert!(r.is_disposed());
    }
}
